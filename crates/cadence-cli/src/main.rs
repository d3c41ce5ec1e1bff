//! Cadence CLI - line-driven music player

mod cli;
mod settings;

use std::io::{ self, BufRead, Write };
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Args;
use settings::Settings;

use cadence_core::{
    command::{ self, format_time },
    library,
    CacheDirResolver, Command, CommandError, Engine, EngineConfig, EngineParts, Event,
    OutputBackend, Playlist, PlaylistManager, PlaylistTarget, Queue, SourceResolver, TrackInfo,
};


/// Application state.
struct App {
    engine: Arc<Engine>,
    settings: Settings,
    /// Default location for /save and /load, and the session queue
    queue_path: Option<PathBuf>,
    playlists: Option<PlaylistManager>,
    should_quit: bool,
}


impl App {
    fn new( args: &Args ) -> Result<Self> {
        let settings = Settings::load();

        let cache_dir = args.cache_dir.clone()
            .or_else( || settings.cache_dir.clone() )
            .or_else( CacheDirResolver::default_dir );
        let resolver = cache_dir.map( |dir| {
            tracing::debug!( "Remote cache: {:?}", dir );
            Arc::new( CacheDirResolver::new( dir ) ) as Arc<dyn SourceResolver>
        });

        let config = EngineConfig {
            backend: if args.null_output { OutputBackend::Null } else { OutputBackend::Cpal },
            volume: settings.volume,
            ..EngineConfig::default()
        };

        let engine = Engine::with_parts( config, EngineParts {
            resolver,
            ..EngineParts::default()
        });
        engine.set_repeat_mode( settings.repeat );
        engine.hub().subscribe_all( print_event );

        if !engine.is_device_available() {
            println!( "No audio device available; playback is disabled (try --null-output)" );
        }
        if args.null_output {
            spawn_null_driver( &engine );
        }

        let mut app = Self {
            engine,
            settings,
            queue_path: Queue::default_path(),
            playlists: PlaylistManager::default_dir().map( PlaylistManager::new ),
            should_quit: false,
        };

        if !args.files.is_empty() {
            for path in &args.files {
                app.add_path( path )?;
            }
            app.engine.play()?;
        } else if app.settings.restore_queue && !args.no_restore {
            app.restore_session();
        }

        Ok( app )
    }


    fn execute_command( &mut self, input: &str ) {
        match Command::parse( input ) {
            Ok( cmd ) => {
                if let Err( e ) = self.run_command( cmd ) {
                    println!( "Error: {}", e );
                }
            }
            Err( e ) => {
                println!( "{}", e );
            }
        }
    }


    fn run_command( &mut self, cmd: Command ) -> Result<()> {
        match cmd {
            Command::Add { path } => {
                let count = self.add_path( &path )?;
                println!( "Added {} track(s)", count );
            }
            Command::Remove { index } => {
                match self.engine.edit_queue( |q| q.remove( index ) ) {
                    Some( track ) => println!( "Removed {}", track.label() ),
                    None => return Err( no_track( index ).into() ),
                }
            }
            Command::Clear => {
                self.engine.edit_queue( |q| q.clear() );
                println!( "Queue cleared" );
            }
            Command::Move { from, to } => {
                if !self.engine.edit_queue( |q| q.move_track( from, to ) ) {
                    return Err( no_track( from.max( to ) ).into() );
                }
                println!( "Moved track {} to {}", from + 1, to + 1 );
            }
            Command::Jump { index } => {
                let position = self.engine.queue().read().unwrap().play_position( index );
                match position {
                    Some( position ) => {
                        self.engine.play_index( position )?;
                    }
                    None => return Err( no_track( index ).into() ),
                }
            }
            Command::Shuffle => {
                let shuffled = self.engine.toggle_shuffle();
                println!( "Shuffle: {}", if shuffled { "on" } else { "off" } );
            }
            Command::Repeat { mode } => {
                let mode = mode.unwrap_or_else( || self.engine.repeat_mode().cycle() );
                self.engine.set_repeat_mode( mode );
                self.settings.repeat = mode;
                println!( "Repeat: {}", mode );
            }
            Command::List => {
                self.print_queue();
            }
            Command::Save { path } => {
                let path = self.resolve_queue_path( path )?;
                self.engine.save_queue( &path )?;
                println!( "Saved queue to {}", path.display() );
            }
            Command::Load { path } => {
                let path = self.resolve_queue_path( path )?;
                self.engine.load_queue( &path )?;
                println!( "Loaded queue from {}", path.display() );
            }
            Command::Watch { path } => {
                if !path.is_dir() {
                    return Err( CommandError::ExecutionFailed( format!( "{} is not a folder", path.display() ) ).into() );
                }
                if self.settings.watch_folder( path.clone() ) {
                    println!( "Watching {}", path.display() );
                } else {
                    println!( "Already watching {}", path.display() );
                }
            }
            Command::Scan => {
                if self.settings.library.is_empty() {
                    println!( "No music folders yet (add one with /watch)" );
                    return Ok(());
                }
                let tracks = self.settings.scanner().scan()?;
                let count = tracks.len();
                self.engine.edit_queue( |q| q.add_all( tracks ) );
                println!( "Added {} track(s) from {} folder(s)", count, self.settings.library.len() );
            }
            Command::Export { target } => {
                let tracks: Vec<TrackInfo> = self.engine.queue().read().unwrap().tracks().to_vec();
                let count = tracks.len();
                let path = match target {
                    PlaylistTarget::File( path ) => {
                        let name = path.file_stem()
                            .map( |s| s.to_string_lossy().into_owned() )
                            .unwrap_or_default();
                        Playlist::new( name, tracks ).write_m3u( &path )?;
                        path
                    }
                    PlaylistTarget::Named( name ) => self.playlist_manager()?.save( &Playlist::new( name, tracks ) )?,
                };
                println!( "Exported {} track(s) to {}", count, path.display() );
            }
            Command::Import { target } => {
                let playlist = match target {
                    PlaylistTarget::File( path ) => Playlist::read_m3u( &path )?,
                    PlaylistTarget::Named( name ) => self.playlist_manager()?.load( &name )?,
                };
                let count = playlist.tracks.len();
                self.engine.edit_queue( |q| q.add_all( playlist.tracks ) );
                println!( "Added {} track(s) from '{}'", count, playlist.name );
            }
            Command::Playlists => {
                let names = self.playlist_manager()?.list()?;
                if names.is_empty() {
                    println!( "No saved playlists" );
                }
                for name in names {
                    println!( "  {}", name );
                }
            }
            Command::Play => {
                self.engine.play()?;
            }
            Command::Pause => {
                self.engine.pause()?;
            }
            Command::Toggle => {
                self.engine.toggle_play_pause()?;
            }
            Command::Stop => {
                self.engine.stop()?;
            }
            Command::Next => {
                if !self.engine.play_next()? {
                    println!( "End of queue" );
                }
            }
            Command::Prev => {
                if !self.engine.play_previous()? {
                    println!( "No previous track" );
                }
            }
            Command::Seek { position } => {
                self.engine.seek( position )?;
                println!( "Seeked to {}", format_time( position ) );
            }
            Command::Volume { level } => {
                if let Some( level ) = level {
                    let volume = self.engine.set_volume( level as f32 / 100.0 );
                    self.settings.volume = volume;
                }
                println!( "Volume: {}%", ( self.engine.volume() * 100.0 ).round() as u32 );
            }
            Command::Status => {
                self.print_status();
            }
            Command::Help => {
                println!( "{}", command::help_text() );
            }
            Command::Quit => {
                self.should_quit = true;
            }
        }
        Ok(())
    }


    /// Queues a file or every audio file under a directory.
    fn add_path( &self, path: &Path ) -> Result<usize> {
        let tracks = library::tracks_from_path( path )?;
        let count = tracks.len();
        self.engine.edit_queue( |q| q.add_all( tracks ) );
        Ok( count )
    }


    fn playlist_manager( &self ) -> Result<&PlaylistManager> {
        self.playlists.as_ref()
            .ok_or_else( || CommandError::ExecutionFailed( "Could not determine playlist folder".into() ).into() )
    }


    fn resolve_queue_path( &self, path: Option<PathBuf> ) -> Result<PathBuf> {
        path.or_else( || self.queue_path.clone() )
            .ok_or_else( || CommandError::ExecutionFailed( "Could not determine queue location".into() ).into() )
    }


    fn print_queue( &self ) {
        let queue = self.engine.queue();
        let queue = queue.read().unwrap();

        if queue.is_empty() {
            println!( "Queue is empty" );
            return;
        }

        let current = queue.current_track_index();
        for ( i, track ) in queue.tracks().iter().enumerate() {
            let marker = if current == Some( i ) { ">" } else { " " };
            println!( "{} {:>3}. {} [{}]", marker, i + 1, track.label(), format_time( track.duration ) );
        }
    }


    fn print_status( &self ) {
        let engine = &self.engine;
        match engine.current_track() {
            Some( track ) => println!(
                "{} {} [{} / {}]",
                engine.state(),
                track.label(),
                format_time( engine.position() ),
                format_time( engine.duration() ),
            ),
            None => println!( "{}", engine.state() ),
        }
        println!(
            "Volume: {}%  Repeat: {}  Shuffle: {}",
            ( engine.volume() * 100.0 ).round() as u32,
            engine.repeat_mode(),
            if engine.is_shuffled() { "on" } else { "off" },
        );
    }


    fn restore_session( &self ) {
        let Some( path ) = self.queue_path.as_deref() else {
            return;
        };
        if !path.exists() {
            return;
        }

        match self.engine.load_queue( path ) {
            Ok(()) => {
                let count = self.engine.queue().read().unwrap().len();
                println!( "Restored {} track(s) from last session", count );
            }
            Err( e ) => tracing::warn!( "Failed to restore queue: {}", e ),
        }
    }


    /// Saves settings and, when enabled, the queue.
    fn save_session( &mut self ) {
        self.settings.volume = self.engine.volume();
        self.settings.repeat = self.engine.repeat_mode();
        self.settings.save();

        if !self.settings.restore_queue {
            return;
        }
        if let Some( path ) = self.queue_path.as_deref() {
            if let Err( e ) = self.engine.save_queue( path ) {
                tracing::warn!( "Failed to save session queue: {}", e );
            }
        }
    }
}


fn no_track( index: usize ) -> CommandError {
    CommandError::ExecutionFailed( format!( "No track {}", index + 1 ) )
}


fn print_event( event: &Event ) {
    match event {
        Event::TrackChanged { track } => println!( "Now playing: {}", track.label() ),
        Event::PlaybackPaused => println!( "Paused" ),
        Event::PlaybackStopped => println!( "Stopped" ),
        Event::Error { message } => println!( "Error: {}", message ),
        _ => {}
    }
}


/// Paces the renderer in real time when there is no device to pull audio.
fn spawn_null_driver( engine: &Arc<Engine> ) {
    let engine = Arc::downgrade( engine );

    let spawned = thread::Builder::new()
        .name( "cadence-null-output".into() )
        .spawn( move || {
            let mut buffer = Vec::new();
            loop {
                thread::sleep( Duration::from_millis( 10 ) );
                let Some( engine ) = engine.upgrade() else { break };

                let format = engine.output_format();
                let channels = format.channels as usize;
                buffer.resize( ( format.sample_rate / 100 ) as usize * channels, 0.0 );
                engine.render( &mut buffer, channels );
            }
        });

    if let Err( e ) = spawned {
        tracing::error!( "Failed to start null output: {}", e );
    }
}


fn init_logging( verbose: bool ) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else( |_| EnvFilter::new( default ) )
        )
        .with_writer( io::stderr )
        .init();
}


fn main() -> Result<()> {
    let args = Args::parse();
    init_logging( args.verbose );

    let mut app = App::new( &args )?;
    println!( "cadence {} - type /help for commands", env!( "CARGO_PKG_VERSION" ) );

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!( "> " );
        io::stdout().flush()?;

        let Some( line ) = lines.next() else {
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        app.execute_command( &line );

        if app.should_quit {
            break;
        }
    }

    // Save session before quitting
    app.save_session();
    app.engine.shutdown();

    Ok(())
}
