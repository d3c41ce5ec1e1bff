//! Playback engine
//!
//! The Engine ties the decoder, the queue and the notification hub to one
//! output stream. Control methods may be called from any thread; they are
//! serialized by a transition lock. The output device pulls audio through
//! `render`, which only reads atomics and `try_lock`s the decoder slot. When
//! a track runs out, `render` posts a deferred `TrackEnded` event and the
//! transition runs later on the event worker (or in `process_deferred`).

use std::fmt;
use std::path::Path;
use std::sync::atomic::{ AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering };
use std::sync::{ Arc, Condvar, Mutex, RwLock };
use std::thread;
use std::time::Duration;

use crossbeam_channel::{ bounded, Sender };
use thiserror::Error;

use crate::decoder::{ DecoderError, DecoderOpener, FrameSource, OutputFormat, SymphoniaOpener };
use crate::hub::{ Event, NotificationHub };
use crate::output::{ CpalOutput, NullOutput, OutputBackend, OutputError, OutputStream };
use crate::queue::{ Queue, QueueError, RepeatMode };
use crate::source::{ ResolveError, SourceResolver };
use crate::track::{ Locator, TrackInfo };


/// Errors that can occur during playback.
#[derive( Debug, Error )]
pub enum EngineError {
    #[error( "Queue is empty" )]
    EmptyQueue,

    #[error( "No track loaded" )]
    NoTrackLoaded,

    #[error( "Audio device unavailable" )]
    DeviceUnavailable,

    #[error( "Cannot seek to {0:?}" )]
    SeekFailed( Duration ),

    #[error( "No playable source for track {0}" )]
    NoSource( String ),

    #[error( "Decode error: {0}" )]
    Decoder( #[from] DecoderError ),

    #[error( "Audio output error: {0}" )]
    Output( #[from] OutputError ),

    #[error( "Queue error: {0}" )]
    Queue( #[from] QueueError ),

    #[error( "Source error: {0}" )]
    Resolve( #[from] ResolveError ),
}


/// Current playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
#[repr( u8 )]
pub enum PlaybackState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    /// A new track is being opened
    Buffering = 3,
}


impl PlaybackState {
    fn from_u8( value: u8 ) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            3 => PlaybackState::Buffering,
            _ => PlaybackState::Stopped,
        }
    }
}


impl fmt::Display for PlaybackState {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.write_str( match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Buffering => "buffering",
        })
    }
}


/// Receives every rendered block (interleaved samples, channel count).
///
/// Runs on the audio thread and is skipped while its slot is being replaced.
pub type AnalysisCallback = Box<dyn FnMut( &[f32], usize ) + Send>;


/// Engine settings.
#[derive( Debug, Clone )]
pub struct EngineConfig {
    /// Format requested from the device; decoders convert to what it grants
    pub output_format: OutputFormat,
    pub backend: OutputBackend,
    pub progress_interval: Duration,
    /// Initial volume (0.0 to 1.0)
    pub volume: f32,
    /// Run a worker thread that drains deferred events. When false the host
    /// must call `process_deferred` from its own loop.
    pub event_thread: bool,
}


impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::default(),
            backend: OutputBackend::default(),
            progress_interval: Duration::from_millis( 250 ),
            volume: 0.8,
            event_thread: true,
        }
    }
}


/// Collaborators handed to the engine at construction.
pub struct EngineParts {
    pub hub: Arc<NotificationHub>,
    pub queue: Arc<RwLock<Queue>>,
    pub opener: Arc<dyn DecoderOpener>,
    pub resolver: Option<Arc<dyn SourceResolver>>,
}


impl Default for EngineParts {
    fn default() -> Self {
        Self {
            hub: Arc::new( NotificationHub::new() ),
            queue: Arc::new( RwLock::new( Queue::new() ) ),
            opener: Arc::new( SymphoniaOpener ),
            resolver: None,
        }
    }
}


/// State shared with the audio callback.
struct Shared {
    state: AtomicU8,
    /// f32 bits
    volume: AtomicU32,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    analysis: Mutex<Option<AnalysisCallback>>,
    /// Frame cursor of the loaded source
    position: AtomicU64,
    total_frames: AtomicU64,
    sample_rate: AtomicU32,
    /// Bumped whenever the loaded source or its cursor changes under the callback
    generation: AtomicU64,
    /// Set once the end of the current generation has been posted
    end_signalled: AtomicBool,
    hub: Arc<NotificationHub>,
}


impl Shared {
    fn state( &self ) -> PlaybackState {
        PlaybackState::from_u8( self.state.load( Ordering::Acquire ) )
    }


    fn set_state( &self, state: PlaybackState ) {
        self.state.store( state as u8, Ordering::Release );
    }


    fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }


    fn position( &self ) -> Duration {
        frames_to_duration( self.position.load( Ordering::Relaxed ), self.sample_rate.load( Ordering::Relaxed ) )
    }


    fn duration( &self ) -> Duration {
        frames_to_duration( self.total_frames.load( Ordering::Relaxed ), self.sample_rate.load( Ordering::Relaxed ) )
    }


    /// Realtime callback body. Must not block, allocate or panic.
    fn render( &self, data: &mut [f32], channels: usize ) {
        if channels == 0 || self.state() != PlaybackState::Playing {
            data.fill( 0.0 );
            return;
        }

        let Ok( mut slot ) = self.source.try_lock() else {
            data.fill( 0.0 );
            return;
        };
        let Some( source ) = slot.as_mut() else {
            data.fill( 0.0 );
            return;
        };

        // Sources are opened in the device layout
        if source.channels() as usize != channels {
            data.fill( 0.0 );
            return;
        }

        let frames = data.len() / channels;
        let produced = source.read_frames( data, frames );
        let written = produced * channels;

        let volume = self.volume();
        for sample in &mut data[ ..written ] {
            *sample *= volume;
        }
        data[ written.. ].fill( 0.0 );

        let position = source.current_frame();
        let total = source.total_frames();
        self.position.store( position, Ordering::Relaxed );

        let ended = produced < frames
            || source.has_error()
            || ( total > 0 && position >= total );

        if written > 0 {
            if let Ok( mut analysis ) = self.analysis.try_lock() {
                if let Some( callback ) = analysis.as_mut() {
                    callback( &data[ ..written ], channels );
                }
            }
        }

        if ended && !self.end_signalled.swap( true, Ordering::AcqRel ) {
            let generation = self.generation.load( Ordering::Acquire );
            if !self.hub.post( Event::TrackEnded { generation } ) {
                // Queue full, try again on the next callback
                self.end_signalled.store( false, Ordering::Release );
            }
        }
    }
}


fn frames_to_duration( frames: u64, sample_rate: u32 ) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64( frames as f64 / sample_rate as f64 )
}


fn clamp_volume( volume: f32 ) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp( 0.0, 1.0 )
    }
}


/// Background thread emitting `PlaybackProgress` while playing.
struct ProgressTimer {
    stop: Arc<( Mutex<bool>, Condvar )>,
    handle: thread::JoinHandle<()>,
}


impl ProgressTimer {
    fn start( interval: Duration, shared: Arc<Shared> ) -> Option<Self> {
        let stop = Arc::new( ( Mutex::new( false ), Condvar::new() ) );
        let signal = Arc::clone( &stop );

        let spawned = thread::Builder::new()
            .name( "cadence-progress".into() )
            .spawn( move || {
                let ( lock, cvar ) = &*signal;
                loop {
                    let guard = lock.lock().unwrap();
                    let ( guard, _ ) = cvar
                        .wait_timeout_while( guard, interval, |stopped| !*stopped )
                        .unwrap();
                    if *guard {
                        break;
                    }
                    drop( guard );

                    if shared.state() == PlaybackState::Playing {
                        shared.hub.emit_playback_progress( shared.position(), shared.duration() );
                    }
                }
            });

        match spawned {
            Ok( handle ) => Some( Self { stop, handle } ),
            Err( e ) => {
                tracing::error!( "Failed to start progress timer: {}", e );
                None
            }
        }
    }


    fn signal( &self ) {
        let ( lock, cvar ) = &*self.stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }


    fn join( self ) {
        // A progress subscriber may be the one stopping playback
        if self.handle.thread().id() != thread::current().id() {
            let _ = self.handle.join();
        }
    }
}


struct Worker {
    shutdown: Sender<()>,
    handle: thread::JoinHandle<()>,
}


/// Core audio engine.
pub struct Engine {
    config: EngineConfig,
    shared: Arc<Shared>,
    hub: Arc<NotificationHub>,
    queue: Arc<RwLock<Queue>>,
    opener: Arc<dyn DecoderOpener>,
    resolver: Option<Arc<dyn SourceResolver>>,
    output: Mutex<Option<Box<dyn OutputStream>>>,
    format: OutputFormat,
    current_track: RwLock<Option<TrackInfo>>,
    repeat: Mutex<RepeatMode>,
    transition: Mutex<()>,
    progress: Mutex<Option<ProgressTimer>>,
    /// Signalled timers waiting to be joined outside the transition lock
    retired: Mutex<Vec<ProgressTimer>>,
    worker: Mutex<Option<Worker>>,
}


impl Engine {
    /// Creates an engine with its own hub and queue, decoding with Symphonia.
    pub fn new( config: EngineConfig ) -> Arc<Self> {
        Self::with_parts( config, EngineParts::default() )
    }


    /// Creates an engine around the given collaborators.
    ///
    /// A missing or broken output device does not fail construction: the
    /// engine stays usable for queue work and playback calls return
    /// `EngineError::DeviceUnavailable`.
    pub fn with_parts( config: EngineConfig, parts: EngineParts ) -> Arc<Self> {
        let shared = Arc::new( Shared {
            state: AtomicU8::new( PlaybackState::Stopped as u8 ),
            volume: AtomicU32::new( clamp_volume( config.volume ).to_bits() ),
            source: Mutex::new( None ),
            analysis: Mutex::new( None ),
            position: AtomicU64::new( 0 ),
            total_frames: AtomicU64::new( 0 ),
            sample_rate: AtomicU32::new( 0 ),
            generation: AtomicU64::new( 0 ),
            end_signalled: AtomicBool::new( false ),
            hub: Arc::clone( &parts.hub ),
        });

        let output = open_output( &config, &shared );
        let format = output.as_ref().map_or( config.output_format, |o| o.format() );

        let engine = Arc::new( Self {
            config,
            shared,
            hub: parts.hub,
            queue: parts.queue,
            opener: parts.opener,
            resolver: parts.resolver,
            output: Mutex::new( output ),
            format,
            current_track: RwLock::new( None ),
            repeat: Mutex::new( RepeatMode::Off ),
            transition: Mutex::new( () ),
            progress: Mutex::new( None ),
            retired: Mutex::new( Vec::new() ),
            worker: Mutex::new( None ),
        });

        if engine.config.event_thread {
            engine.spawn_worker();
        }

        engine
    }


    /// Starts or resumes playback.
    ///
    /// From Stopped this opens the queue's current track.
    pub fn play( &self ) -> Result<(), EngineError> {
        self.transact( |out| self.play_locked( out ) )
    }


    /// Pauses playback. No-op unless playing.
    pub fn pause( &self ) -> Result<(), EngineError> {
        self.transact( |out| self.pause_locked( out ) )
    }


    /// Stops playback and unloads the current track.
    pub fn stop( &self ) -> Result<(), EngineError> {
        self.transact( |out| {
            self.stop_locked( out );
            Ok(())
        })
    }


    pub fn toggle_play_pause( &self ) -> Result<(), EngineError> {
        self.transact( |out| {
            if self.shared.state() == PlaybackState::Playing {
                self.pause_locked( out )
            } else {
                self.play_locked( out )
            }
        })
    }


    /// Replaces whatever is loaded with `track` and starts playing it.
    ///
    /// The queue cursor is not touched.
    pub fn play_track( &self, track: TrackInfo ) -> Result<(), EngineError> {
        self.transact( |out| self.start_track( track, out ) )
    }


    /// Jumps the queue to a play-order position and plays it.
    /// Returns Ok(false) if the position is out of range.
    pub fn play_index( &self, index: usize ) -> Result<bool, EngineError> {
        self.transact( |out| {
            let track = self.queue.write().unwrap().jump_to( index ).cloned();
            match track {
                Some( track ) => self.start_track( track, out ).map( |_| true ),
                None => Ok( false ),
            }
        })
    }


    /// Plays the next track in the queue, stopping at the end.
    /// Returns Ok(true) if a track was started.
    pub fn play_next( &self ) -> Result<bool, EngineError> {
        self.transact( |out| {
            let next = self.queue.write().unwrap().next().cloned();
            match next {
                Some( track ) => self.start_track( track, out ).map( |_| true ),
                None => {
                    self.stop_locked( out );
                    Ok( false )
                }
            }
        })
    }


    /// Plays the previous track in the queue.
    /// Returns Ok(false), leaving playback alone, if there is none.
    pub fn play_previous( &self ) -> Result<bool, EngineError> {
        self.transact( |out| {
            let previous = self.queue.write().unwrap().previous().cloned();
            match previous {
                Some( track ) => self.start_track( track, out ).map( |_| true ),
                None => Ok( false ),
            }
        })
    }


    /// Seeks within the loaded track.
    ///
    /// Failure leaves the playback state and position untouched.
    pub fn seek( &self, position: Duration ) -> Result<(), EngineError> {
        let _guard = self.transition.lock().unwrap();
        let mut slot = self.shared.source.lock().unwrap();
        let source = slot.as_mut().ok_or( EngineError::NoTrackLoaded )?;

        let frame = ( position.as_millis() * source.sample_rate() as u128 / 1000 ) as u64;
        if !source.seek( frame ) {
            tracing::warn!( "Seek to {:?} failed", position );
            return Err( EngineError::SeekFailed( position ) );
        }

        self.shared.position.store( source.current_frame(), Ordering::Relaxed );
        self.shared.generation.fetch_add( 1, Ordering::AcqRel );
        self.shared.end_signalled.store( false, Ordering::Release );
        tracing::info!( "Seeked to {:?}", position );
        Ok(())
    }


    /// Sets the volume, clamped to 0.0..=1.0 (NaN counts as 0.0).
    ///
    /// Returns the value actually applied.
    pub fn set_volume( &self, volume: f32 ) -> f32 {
        let volume = clamp_volume( volume );
        self.shared.volume.store( volume.to_bits(), Ordering::Relaxed );
        self.hub.emit_volume_changed( volume );
        volume
    }


    pub fn volume( &self ) -> f32 {
        self.shared.volume()
    }


    pub fn state( &self ) -> PlaybackState {
        self.shared.state()
    }


    pub fn current_track( &self ) -> Option<TrackInfo> {
        self.current_track.read().unwrap().clone()
    }


    /// Position within the loaded track.
    pub fn position( &self ) -> Duration {
        self.shared.position()
    }


    /// Frame cursor of the loaded track, in output frames.
    pub fn position_frames( &self ) -> u64 {
        self.shared.position.load( Ordering::Relaxed )
    }


    /// Length of the loaded track, zero when unknown or nothing is loaded.
    pub fn duration( &self ) -> Duration {
        self.shared.duration()
    }


    pub fn repeat_mode( &self ) -> RepeatMode {
        *self.repeat.lock().unwrap()
    }


    pub fn set_repeat_mode( &self, mode: RepeatMode ) {
        *self.repeat.lock().unwrap() = mode;
        tracing::info!( "Repeat: {}", mode );
    }


    /// The format decoders are opened in, as granted by the device.
    pub fn output_format( &self ) -> OutputFormat {
        self.format
    }


    pub fn is_device_available( &self ) -> bool {
        self.output.lock().unwrap().is_some()
    }


    pub fn hub( &self ) -> Arc<NotificationHub> {
        Arc::clone( &self.hub )
    }


    /// Shared handle to the queue, for reading.
    ///
    /// Edits should go through `edit_queue` so subscribers hear about them.
    pub fn queue( &self ) -> Arc<RwLock<Queue>> {
        Arc::clone( &self.queue )
    }


    /// Runs `edit` on the queue and emits `QueueChanged`.
    pub fn edit_queue<R>( &self, edit: impl FnOnce( &mut Queue ) -> R ) -> R {
        let result = {
            let mut queue = self.queue.write().unwrap();
            edit( &mut queue )
        };
        self.hub.emit_queue_changed();
        result
    }


    pub fn set_shuffle( &self, enabled: bool ) {
        self.edit_queue( |q| if enabled { q.shuffle() } else { q.unshuffle() } );
    }


    /// Flips shuffle and returns the new setting.
    pub fn toggle_shuffle( &self ) -> bool {
        self.edit_queue( |q| {
            if q.is_shuffled() {
                q.unshuffle();
                false
            } else {
                q.shuffle();
                true
            }
        })
    }


    pub fn is_shuffled( &self ) -> bool {
        self.queue.read().unwrap().is_shuffled()
    }


    pub fn save_queue( &self, path: &Path ) -> Result<(), EngineError> {
        self.queue.read().unwrap().save( path )?;
        Ok(())
    }


    /// Replaces the queue with a saved one. Playback is not interrupted.
    pub fn load_queue( &self, path: &Path ) -> Result<(), EngineError> {
        let snapshot = Queue::read_snapshot( path )?;
        self.edit_queue( |q| q.restore( snapshot ) );
        Ok(())
    }


    /// Installs or clears the analysis callback.
    pub fn set_analysis_callback( &self, callback: Option<AnalysisCallback> ) {
        *self.shared.analysis.lock().unwrap() = callback;
    }


    /// The realtime callback: fills `data` with interleaved output samples.
    ///
    /// The cpal backend calls this itself. With `OutputBackend::Null` the host
    /// drives it.
    pub fn render( &self, data: &mut [f32], channels: usize ) {
        self.shared.render( data, channels );
    }


    /// Handles one deferred event: track ends run the end-of-track
    /// transition, everything else is delivered to subscribers.
    pub fn dispatch( &self, event: Event ) {
        match event {
            Event::TrackEnded { generation } => self.on_track_ended( generation ),
            other => self.hub.emit( other ),
        }
    }


    /// Drains the deferred queue on the calling thread.
    ///
    /// Returns the number of events handled.
    pub fn process_deferred( &self ) -> usize {
        let mut handled = 0;
        while let Ok( event ) = self.hub.deferred().try_recv() {
            self.dispatch( event );
            handled += 1;
        }
        handled
    }


    /// Stops playback, joins the worker and releases the device.
    ///
    /// Safe to call repeatedly; the engine cannot play afterwards.
    pub fn shutdown( &self ) {
        if let Err( e ) = self.stop() {
            tracing::warn!( "Stop during shutdown failed: {}", e );
        }

        let worker = self.worker.lock().unwrap().take();
        if let Some( worker ) = worker {
            let _ = worker.shutdown.send( () );
            if worker.handle.thread().id() != thread::current().id() {
                let _ = worker.handle.join();
            }
        }

        if self.output.lock().unwrap().take().is_some() {
            tracing::info!( "Engine shut down" );
        }
    }


    /// Runs a state change under the transition lock. Once the lock is
    /// released, joins the progress timers it stopped and delivers the events
    /// it produced.
    fn transact<T>(
        &self,
        change: impl FnOnce( &mut Vec<Event> ) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut outbox = Vec::new();
        let result = {
            let _guard = self.transition.lock().unwrap();
            change( &mut outbox )
        };

        // Progress subscribers may be blocked on the transition lock
        let retired = std::mem::take( &mut *self.retired.lock().unwrap() );
        for timer in retired {
            timer.join();
        }

        for event in outbox {
            self.hub.emit( event );
        }
        result
    }


    fn start_track( &self, track: TrackInfo, out: &mut Vec<Event> ) -> Result<(), EngineError> {
        if !self.is_device_available() {
            return Err( EngineError::DeviceUnavailable );
        }

        let was = self.shared.state();
        self.stop_progress();
        self.pause_output();
        self.shared.set_state( PlaybackState::Buffering );
        self.close_source();

        tracing::info!( "Playing: {}", track.label() );

        let source = match self.open_track( &track ) {
            Ok( source ) => source,
            Err( e ) => return Err( self.abort_start( was, e, out ) ),
        };

        self.install_source( source );
        *self.current_track.write().unwrap() = Some( track.clone() );
        out.push( Event::TrackChanged { track: track.clone() } );

        let started = match self.output.lock().unwrap().as_ref() {
            Some( output ) => output.start().map_err( EngineError::from ),
            None => Err( EngineError::DeviceUnavailable ),
        };
        if let Err( e ) = started {
            self.close_source();
            return Err( self.abort_start( was, e, out ) );
        }

        self.shared.set_state( PlaybackState::Playing );
        self.start_progress();
        out.push( Event::PlaybackStarted { track } );
        Ok(())
    }


    fn abort_start( &self, was: PlaybackState, error: EngineError, out: &mut Vec<Event> ) -> EngineError {
        tracing::error!( "Failed to start playback: {}", error );
        self.shared.set_state( PlaybackState::Stopped );
        *self.current_track.write().unwrap() = None;

        if matches!( was, PlaybackState::Playing | PlaybackState::Paused ) {
            out.push( Event::PlaybackStopped );
        }
        out.push( Event::Error { message: error.to_string() } );
        error
    }


    /// Tries the track's locators in order: the local path, then the remote
    /// handle through the resolver.
    fn open_track( &self, track: &TrackInfo ) -> Result<Box<dyn FrameSource>, EngineError> {
        let mut last_error = None;

        for locator in track.locators() {
            let path = match locator {
                Locator::Local( path ) => path,
                Locator::Remote( handle ) => {
                    let Some( resolver ) = self.resolver.as_ref() else {
                        tracing::debug!( "No resolver for remote handle {}", handle );
                        continue;
                    };
                    match resolver.resolve( &handle ) {
                        Ok( path ) => path,
                        Err( e ) => {
                            tracing::warn!( "Could not resolve {}: {}", handle, e );
                            last_error = Some( e.into() );
                            continue;
                        }
                    }
                }
            };

            match self.opener.open( &path, self.format ) {
                Ok( source ) => {
                    tracing::debug!( "Opened {:?}", path );
                    return Ok( source );
                }
                Err( e ) => {
                    tracing::warn!( "Failed to open {:?}: {}", path, e );
                    last_error = Some( e.into() );
                }
            }
        }

        Err( last_error.unwrap_or_else( || EngineError::NoSource( track.id.clone() ) ) )
    }


    fn play_locked( &self, out: &mut Vec<Event> ) -> Result<(), EngineError> {
        match self.shared.state() {
            PlaybackState::Playing => Ok(()),
            PlaybackState::Paused => self.resume_locked( out ),
            PlaybackState::Stopped | PlaybackState::Buffering => {
                let track = self.queue.read().unwrap()
                    .current()
                    .cloned()
                    .ok_or( EngineError::EmptyQueue )?;
                self.start_track( track, out )
            }
        }
    }


    fn pause_locked( &self, out: &mut Vec<Event> ) -> Result<(), EngineError> {
        if self.shared.state() != PlaybackState::Playing {
            return Ok(());
        }

        if let Some( output ) = self.output.lock().unwrap().as_ref() {
            output.pause()?;
        }
        self.shared.set_state( PlaybackState::Paused );
        self.stop_progress();
        out.push( Event::PlaybackPaused );
        tracing::info!( "Paused" );
        Ok(())
    }


    fn resume_locked( &self, out: &mut Vec<Event> ) -> Result<(), EngineError> {
        match self.output.lock().unwrap().as_ref() {
            Some( output ) => output.start()?,
            None => return Err( EngineError::DeviceUnavailable ),
        }

        self.shared.set_state( PlaybackState::Playing );
        self.start_progress();
        if let Some( track ) = self.current_track() {
            out.push( Event::PlaybackStarted { track } );
        }
        tracing::info!( "Resumed" );
        Ok(())
    }


    fn stop_locked( &self, out: &mut Vec<Event> ) {
        let was = self.shared.state();

        self.stop_progress();
        self.pause_output();
        self.shared.set_state( PlaybackState::Stopped );
        self.close_source();
        *self.current_track.write().unwrap() = None;

        if was != PlaybackState::Stopped {
            out.push( Event::PlaybackStopped );
            tracing::info!( "Stopped" );
        }
    }


    fn on_track_ended( &self, generation: u64 ) {
        let result = self.transact( |out| {
            if generation != self.shared.generation.load( Ordering::Acquire ) {
                tracing::debug!( "Ignoring stale track end" );
                return Ok(());
            }

            if self.shared.state() != PlaybackState::Playing {
                // Paused right at the end; let the callback report it again
                self.shared.end_signalled.store( false, Ordering::Release );
                return Ok(());
            }

            out.push( Event::TrackEnded { generation } );
            let repeat = self.repeat_mode();

            if repeat == RepeatMode::One {
                if self.rewind() {
                    tracing::debug!( "Repeating track" );
                    return Ok(());
                }
                if let Some( track ) = self.current_track() {
                    return self.start_track( track, out );
                }
            }

            let next = self.queue.write().unwrap().next().cloned();
            if let Some( track ) = next {
                return self.start_track( track, out );
            }

            if repeat == RepeatMode::All {
                let first = self.queue.write().unwrap().jump_to( 0 ).cloned();
                if let Some( track ) = first {
                    return self.start_track( track, out );
                }
            }

            self.stop_locked( out );
            Ok(())
        });

        if let Err( e ) = result {
            tracing::error!( "Track transition failed: {}", e );
        }
    }


    /// Puts the loaded source back at frame 0. False if it cannot be reused.
    fn rewind( &self ) -> bool {
        let mut slot = self.shared.source.lock().unwrap();
        let Some( source ) = slot.as_mut() else {
            return false;
        };

        if source.has_error() || !source.seek( 0 ) {
            return false;
        }

        self.shared.position.store( 0, Ordering::Relaxed );
        self.shared.generation.fetch_add( 1, Ordering::AcqRel );
        self.shared.end_signalled.store( false, Ordering::Release );
        true
    }


    fn install_source( &self, source: Box<dyn FrameSource> ) {
        let mut slot = self.shared.source.lock().unwrap();
        self.shared.generation.fetch_add( 1, Ordering::AcqRel );
        self.shared.total_frames.store( source.total_frames(), Ordering::Relaxed );
        self.shared.sample_rate.store( source.sample_rate(), Ordering::Relaxed );
        self.shared.position.store( source.current_frame(), Ordering::Relaxed );
        self.shared.end_signalled.store( false, Ordering::Release );
        *slot = Some( source );
    }


    /// Takes the source out of the callback's reach and closes it.
    fn close_source( &self ) {
        let old = {
            let mut slot = self.shared.source.lock().unwrap();
            self.shared.generation.fetch_add( 1, Ordering::AcqRel );
            self.shared.position.store( 0, Ordering::Relaxed );
            self.shared.total_frames.store( 0, Ordering::Relaxed );
            slot.take()
        };

        if let Some( mut source ) = old {
            source.close();
        }
    }


    fn pause_output( &self ) {
        if let Some( output ) = self.output.lock().unwrap().as_ref() {
            if let Err( e ) = output.pause() {
                tracing::warn!( "Failed to pause output: {}", e );
            }
        }
    }


    fn start_progress( &self ) {
        let mut progress = self.progress.lock().unwrap();
        if progress.is_none() {
            *progress = ProgressTimer::start( self.config.progress_interval, Arc::clone( &self.shared ) );
        }
    }


    /// Signals the timer to exit. `transact` joins it after the lock drops.
    fn stop_progress( &self ) {
        let timer = self.progress.lock().unwrap().take();
        if let Some( timer ) = timer {
            timer.signal();
            self.retired.lock().unwrap().push( timer );
        }
    }


    fn spawn_worker( self: &Arc<Self> ) {
        let ( shutdown_tx, shutdown_rx ) = bounded::<()>( 1 );
        let events = self.hub.deferred().clone();
        let engine = Arc::downgrade( self );

        let spawned = thread::Builder::new()
            .name( "cadence-events".into() )
            .spawn( move || {
                loop {
                    crossbeam_channel::select! {
                        recv( events ) -> event => {
                            let Ok( event ) = event else { break };
                            let Some( engine ) = engine.upgrade() else { break };
                            engine.dispatch( event );
                        }
                        recv( shutdown_rx ) -> _ => break,
                    }
                }
                tracing::debug!( "Event worker exiting" );
            });

        match spawned {
            Ok( handle ) => {
                *self.worker.lock().unwrap() = Some( Worker { shutdown: shutdown_tx, handle } );
            }
            Err( e ) => tracing::error!( "Failed to start event worker: {}", e ),
        }
    }
}


impl Drop for Engine {
    fn drop( &mut self ) {
        self.shutdown();
    }
}


fn open_output( config: &EngineConfig, shared: &Arc<Shared> ) -> Option<Box<dyn OutputStream>> {
    match config.backend {
        OutputBackend::Null => Some( Box::new( NullOutput::new( config.output_format ) ) ),
        OutputBackend::Cpal => {
            let shared = Arc::clone( shared );
            match CpalOutput::open( config.output_format, move |data, channels| shared.render( data, channels ) ) {
                Ok( output ) => Some( Box::new( output ) ),
                Err( e ) => {
                    tracing::warn!( "Audio output unavailable, playback disabled: {}", e );
                    None
                }
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use crate::hub::EventKind;


    /// Constant 0.5 signal of a fixed length.
    struct Tone {
        format: OutputFormat,
        total: u64,
        pos: u64,
        open: bool,
        closed: Arc<AtomicUsize>,
    }


    impl FrameSource for Tone {
        fn sample_rate( &self ) -> u32 {
            self.format.sample_rate
        }

        fn channels( &self ) -> u16 {
            self.format.channels
        }

        fn total_frames( &self ) -> u64 {
            self.total
        }

        fn current_frame( &self ) -> u64 {
            self.pos
        }

        fn read_frames( &mut self, buffer: &mut [f32], max_frames: usize ) -> usize {
            if !self.open {
                return 0;
            }
            let channels = self.format.channels as usize;
            let frames = max_frames
                .min( buffer.len() / channels )
                .min( ( self.total - self.pos ) as usize );
            buffer[ ..frames * channels ].fill( 0.5 );
            self.pos += frames as u64;
            frames
        }

        fn seek( &mut self, frame: u64 ) -> bool {
            if !self.open || frame > self.total {
                return false;
            }
            self.pos = frame;
            true
        }

        fn has_error( &self ) -> bool {
            false
        }

        fn close( &mut self ) {
            if self.open {
                self.open = false;
                self.closed.fetch_add( 1, Ordering::SeqCst );
            }
        }

        fn is_open( &self ) -> bool {
            self.open
        }
    }


    #[derive( Default )]
    struct ToneOpener {
        lengths: HashMap<PathBuf, u64>,
        opened: Mutex<Vec<PathBuf>>,
        closed: Arc<AtomicUsize>,
    }


    impl DecoderOpener for ToneOpener {
        fn open( &self, path: &Path, format: OutputFormat ) -> Result<Box<dyn FrameSource>, DecoderError> {
            let total = *self.lengths
                .get( path )
                .ok_or_else( || DecoderError::NotFound( path.to_path_buf() ) )?;
            self.opened.lock().unwrap().push( path.to_path_buf() );
            Ok( Box::new( Tone {
                format,
                total,
                pos: 0,
                open: true,
                closed: Arc::clone( &self.closed ),
            }))
        }
    }


    struct MapResolver( HashMap<String, PathBuf> );


    impl SourceResolver for MapResolver {
        fn resolve( &self, handle: &str ) -> Result<PathBuf, ResolveError> {
            self.0.get( handle ).cloned().ok_or_else( || ResolveError::NotCached( handle.to_string() ) )
        }
    }


    struct Fixture {
        engine: Arc<Engine>,
        opener: Arc<ToneOpener>,
        events: Arc<Mutex<Vec<Event>>>,
    }


    impl Fixture {
        fn events( &self ) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn kinds( &self ) -> Vec<EventKind> {
            self.events().iter().map( |e| e.kind() ).collect()
        }

        fn clear_events( &self ) {
            self.events.lock().unwrap().clear();
        }

        fn count( &self, kind: EventKind ) -> usize {
            self.kinds().iter().filter( |&&k| k == kind ).count()
        }

        fn current_id( &self ) -> Option<String> {
            self.engine.current_track().map( |t| t.id )
        }

        fn opened( &self ) -> Vec<PathBuf> {
            self.opener.opened.lock().unwrap().clone()
        }

        /// Renders until the loaded track posts its end, then runs the transition.
        fn finish_track( &self ) {
            let mut buffer = vec![ 0.0; 512 ];
            for _ in 0..10_000 {
                self.engine.render( &mut buffer, 2 );
                if self.engine.hub().pending() > 0 {
                    break;
                }
            }
            self.engine.process_deferred();
        }
    }


    fn path_of( id: &str ) -> PathBuf {
        PathBuf::from( format!( "/music/{}.wav", id ) )
    }


    fn local_track( id: &str ) -> TrackInfo {
        let mut track = TrackInfo::from_path( path_of( id ) );
        track.id = id.to_string();
        track
    }


    fn config( sample_rate: u32 ) -> EngineConfig {
        EngineConfig {
            output_format: OutputFormat { sample_rate, channels: 2 },
            backend: OutputBackend::Null,
            progress_interval: Duration::from_millis( 250 ),
            volume: 1.0,
            event_thread: false,
        }
    }


    fn build(
        config: EngineConfig,
        queued: &[( &str, u64 )],
        extra: &[( PathBuf, u64 )],
        resolver: Option<Arc<dyn SourceResolver>>,
    ) -> Fixture {
        let mut opener = ToneOpener::default();
        let mut queue = Queue::with_seed( 11 );

        for ( id, frames ) in queued {
            opener.lengths.insert( path_of( id ), *frames );
            queue.add( local_track( id ) );
        }
        for ( path, frames ) in extra {
            opener.lengths.insert( path.clone(), *frames );
        }

        let opener = Arc::new( opener );
        let hub = Arc::new( NotificationHub::new() );
        let events = Arc::new( Mutex::new( Vec::new() ) );
        let sink = Arc::clone( &events );
        hub.subscribe_all( move |e| sink.lock().unwrap().push( e.clone() ) );

        let engine = Engine::with_parts( config, EngineParts {
            hub,
            queue: Arc::new( RwLock::new( queue ) ),
            opener: opener.clone(),
            resolver,
        });

        Fixture { engine, opener, events }
    }


    fn fixture( queued: &[( &str, u64 )] ) -> Fixture {
        build( config( 1000 ), queued, &[], None )
    }


    #[test]
    fn test_play_on_empty_queue() {
        let f = fixture( &[] );
        assert!( matches!( f.engine.play(), Err( EngineError::EmptyQueue ) ) );
        assert_eq!( f.engine.state(), PlaybackState::Stopped );
        assert!( f.events().is_empty() );
    }


    #[test]
    fn test_play_opens_current_track() {
        let f = fixture( &[ ( "a", 1000 ), ( "b", 1000 ) ] );
        f.engine.play().unwrap();

        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.current_id().as_deref(), Some( "a" ) );
        assert_eq!( f.events(), vec![
            Event::TrackChanged { track: local_track( "a" ) },
            Event::PlaybackStarted { track: local_track( "a" ) },
        ]);
        assert_eq!( f.engine.duration(), Duration::from_secs( 1 ) );

        // Already playing
        f.engine.play().unwrap();
        assert_eq!( f.events().len(), 2 );
    }


    #[test]
    fn test_play_track_replaces_loaded_track() {
        let f = build( config( 1000 ), &[ ( "u", 5000 ) ], &[ ( path_of( "t" ), 5000 ) ], None );
        f.engine.play().unwrap();
        f.clear_events();

        f.engine.play_track( local_track( "t" ) ).unwrap();

        assert_eq!( f.opener.closed.load( Ordering::SeqCst ), 1 );
        assert_eq!( f.opened(), vec![ path_of( "u" ), path_of( "t" ) ] );
        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.events(), vec![
            Event::TrackChanged { track: local_track( "t" ) },
            Event::PlaybackStarted { track: local_track( "t" ) },
        ]);
    }


    #[test]
    fn test_next_through_queue_then_stop() {
        let f = fixture( &[ ( "A", 180_000 ), ( "B", 120_000 ), ( "C", 240_000 ) ] );
        f.engine.play().unwrap();

        assert!( f.engine.play_next().unwrap() );
        assert_eq!( f.current_id().as_deref(), Some( "B" ) );
        assert!( f.engine.play_next().unwrap() );
        assert_eq!( f.current_id().as_deref(), Some( "C" ) );
        assert_eq!( f.engine.duration(), Duration::from_secs( 240 ) );

        assert!( !f.engine.play_next().unwrap() );
        assert_eq!( f.engine.state(), PlaybackState::Stopped );
        assert!( f.engine.current_track().is_none() );
        assert_eq!( f.count( EventKind::PlaybackStopped ), 1 );
    }


    #[test]
    fn test_track_end_advances_then_stops() {
        let f = fixture( &[ ( "a", 100 ), ( "b", 700 ), ( "c", 300 ) ] );
        f.engine.play().unwrap();

        f.finish_track();
        assert_eq!( f.current_id().as_deref(), Some( "b" ) );
        assert_eq!( f.engine.state(), PlaybackState::Playing );

        f.finish_track();
        assert_eq!( f.current_id().as_deref(), Some( "c" ) );

        f.finish_track();
        assert_eq!( f.engine.state(), PlaybackState::Stopped );
        assert_eq!( f.count( EventKind::TrackEnded ), 3 );
        assert_eq!( f.count( EventKind::PlaybackStopped ), 1 );
        assert_eq!( f.engine.queue().read().unwrap().current_index(), 2 );
    }


    #[test]
    fn test_track_end_posts_once_per_track() {
        let f = fixture( &[ ( "a", 100 ), ( "b", 100 ) ] );
        f.engine.play().unwrap();

        let mut buffer = vec![ 0.0; 512 ];
        for _ in 0..5 {
            f.engine.render( &mut buffer, 2 );
        }
        assert_eq!( f.engine.hub().pending(), 1 );
        assert!( buffer.iter().all( |&s| s == 0.0 ) );
    }


    #[test]
    fn test_repeat_one_rewinds_same_track() {
        let f = fixture( &[ ( "a", 100 ), ( "b", 100 ) ] );
        f.engine.set_repeat_mode( RepeatMode::One );
        f.engine.play().unwrap();

        f.finish_track();

        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.current_id().as_deref(), Some( "a" ) );
        assert_eq!( f.engine.position_frames(), 0 );
        assert_eq!( f.opened().len(), 1 );

        // And it keeps repeating
        f.finish_track();
        assert_eq!( f.current_id().as_deref(), Some( "a" ) );
        assert_eq!( f.engine.state(), PlaybackState::Playing );
    }


    #[test]
    fn test_repeat_all_wraps_to_start() {
        let f = fixture( &[ ( "a", 100 ), ( "b", 100 ) ] );
        f.engine.set_repeat_mode( RepeatMode::All );
        f.engine.play().unwrap();

        f.finish_track();
        assert_eq!( f.current_id().as_deref(), Some( "b" ) );

        f.finish_track();
        assert_eq!( f.current_id().as_deref(), Some( "a" ) );
        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.engine.queue().read().unwrap().current_index(), 0 );
    }


    #[test]
    fn test_stale_track_end_is_ignored() {
        let f = build( config( 1000 ), &[ ( "a", 100 ), ( "b", 100 ) ], &[ ( path_of( "x" ), 1000 ) ], None );
        f.engine.play().unwrap();

        let mut buffer = vec![ 0.0; 512 ];
        f.engine.render( &mut buffer, 2 );
        assert_eq!( f.engine.hub().pending(), 1 );

        f.engine.play_track( local_track( "x" ) ).unwrap();
        f.engine.process_deferred();

        assert_eq!( f.current_id().as_deref(), Some( "x" ) );
        assert_eq!( f.count( EventKind::TrackEnded ), 0 );
    }


    #[test]
    fn test_seek_frame_math() {
        let f = build( config( 44100 ), &[ ( "a", 441_000 ) ], &[], None );
        f.engine.play().unwrap();

        f.engine.seek( Duration::from_micros( 1_234_567 ) ).unwrap();
        // floor( 1234 * 44100 / 1000 )
        assert_eq!( f.engine.position_frames(), 54_419 );
        assert_eq!( f.engine.state(), PlaybackState::Playing );
    }


    #[test]
    fn test_seek_past_end_fails_without_side_effects() {
        let f = build( config( 44100 ), &[ ( "a", 44_100 ) ], &[], None );
        f.engine.play().unwrap();
        f.engine.seek( Duration::from_millis( 500 ) ).unwrap();

        let result = f.engine.seek( Duration::from_secs( 2 ) );
        assert!( matches!( result, Err( EngineError::SeekFailed( _ ) ) ) );
        assert_eq!( f.engine.position_frames(), 22_050 );
        assert_eq!( f.engine.state(), PlaybackState::Playing );

        let mut buffer = vec![ 0.0; 200 ];
        f.engine.render( &mut buffer, 2 );
        assert_eq!( f.engine.position_frames(), 22_150 );
        assert!( buffer.iter().all( |&s| s == 0.5 ) );
    }


    #[test]
    fn test_seek_without_track() {
        let f = fixture( &[ ( "a", 100 ) ] );
        assert!( matches!( f.engine.seek( Duration::from_secs( 1 ) ), Err( EngineError::NoTrackLoaded ) ) );
    }


    #[test]
    fn test_volume_is_clamped_and_applied() {
        let f = fixture( &[ ( "a", 10_000 ) ] );

        assert_eq!( f.engine.set_volume( -1.0 ), 0.0 );
        assert_eq!( f.engine.set_volume( 5.0 ), 1.0 );
        assert_eq!( f.engine.set_volume( f32::NAN ), 0.0 );
        assert_eq!( f.engine.set_volume( 0.5 ), 0.5 );
        assert_eq!( f.engine.volume(), 0.5 );

        assert_eq!( f.events(), vec![
            Event::VolumeChanged { volume: 0.0 },
            Event::VolumeChanged { volume: 1.0 },
            Event::VolumeChanged { volume: 0.0 },
            Event::VolumeChanged { volume: 0.5 },
        ]);

        f.engine.play().unwrap();
        let mut buffer = vec![ 0.0; 64 ];
        f.engine.render( &mut buffer, 2 );
        assert!( buffer.iter().all( |&s| s == 0.25 ) );
    }


    #[test]
    fn test_render_pads_short_reads_with_silence() {
        let f = fixture( &[ ( "a", 10 ) ] );
        f.engine.play().unwrap();

        let mut buffer = vec![ 1.0; 64 ];
        f.engine.render( &mut buffer, 2 );
        assert!( buffer[ ..20 ].iter().all( |&s| s == 0.5 ) );
        assert!( buffer[ 20.. ].iter().all( |&s| s == 0.0 ) );
    }


    #[test]
    fn test_pause_resume_and_noops() {
        let f = fixture( &[ ( "a", 10_000 ) ] );

        f.engine.pause().unwrap();
        assert!( f.events().is_empty() );

        f.engine.play().unwrap();
        f.engine.pause().unwrap();
        f.engine.pause().unwrap();
        assert_eq!( f.engine.state(), PlaybackState::Paused );
        assert_eq!( f.count( EventKind::PlaybackPaused ), 1 );

        let mut buffer = vec![ 1.0; 64 ];
        f.engine.render( &mut buffer, 2 );
        assert!( buffer.iter().all( |&s| s == 0.0 ) );

        f.engine.toggle_play_pause().unwrap();
        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.count( EventKind::PlaybackStarted ), 2 );
        assert_eq!( f.opened().len(), 1 );
    }


    #[test]
    fn test_stop_emits_once_and_closes() {
        let f = fixture( &[ ( "a", 10_000 ) ] );
        f.engine.play().unwrap();

        f.engine.stop().unwrap();
        f.engine.stop().unwrap();

        assert_eq!( f.engine.state(), PlaybackState::Stopped );
        assert_eq!( f.count( EventKind::PlaybackStopped ), 1 );
        assert_eq!( f.opener.closed.load( Ordering::SeqCst ), 1 );
        assert_eq!( f.engine.position_frames(), 0 );
        assert!( matches!( f.engine.seek( Duration::ZERO ), Err( EngineError::NoTrackLoaded ) ) );
    }


    #[test]
    fn test_play_previous_without_history_is_noop() {
        let f = fixture( &[ ( "a", 1000 ), ( "b", 1000 ) ] );
        f.engine.play().unwrap();
        assert!( !f.engine.play_previous().unwrap() );
        assert_eq!( f.current_id().as_deref(), Some( "a" ) );
        assert_eq!( f.engine.state(), PlaybackState::Playing );

        f.engine.play_next().unwrap();
        assert!( f.engine.play_previous().unwrap() );
        assert_eq!( f.current_id().as_deref(), Some( "a" ) );
    }


    #[test]
    fn test_remote_fallback_through_resolver() {
        let cached = PathBuf::from( "/cache/r1.opus" );
        let resolver: Arc<dyn SourceResolver> = Arc::new( MapResolver(
            HashMap::from( [ ( "r1".to_string(), cached.clone() ) ] )
        ));
        let f = build( config( 1000 ), &[], &[ ( cached.clone(), 1000 ) ], Some( resolver ) );

        let mut track = TrackInfo::from_path( "/gone/file.mp3" );
        track.remote = Some( "r1".into() );
        f.engine.play_track( track ).unwrap();

        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.opened(), vec![ cached ] );
    }


    #[test]
    fn test_failed_open_leaves_engine_stopped() {
        let f = fixture( &[ ( "a", 1000 ) ] );
        f.engine.play().unwrap();

        let result = f.engine.play_track( local_track( "missing" ) );
        assert!( matches!( result, Err( EngineError::Decoder( DecoderError::NotFound( _ ) ) ) ) );
        assert_eq!( f.engine.state(), PlaybackState::Stopped );
        assert!( f.engine.current_track().is_none() );
        assert_eq!( f.count( EventKind::PlaybackStopped ), 1 );
        assert_eq!( f.count( EventKind::Error ), 1 );
    }


    #[test]
    fn test_remote_only_track_without_resolver() {
        let f = fixture( &[] );
        let result = f.engine.play_track( TrackInfo::remote( "r", "handle" ) );
        assert!( matches!( result, Err( EngineError::NoSource( _ ) ) ) );
    }


    #[test]
    fn test_analysis_callback_sees_rendered_audio() {
        let f = fixture( &[ ( "a", 10_000 ) ] );
        let seen = Arc::new( AtomicUsize::new( 0 ) );
        let counter = Arc::clone( &seen );
        f.engine.set_analysis_callback( Some( Box::new( move |samples, channels| {
            counter.fetch_add( samples.len() / channels, Ordering::SeqCst );
        })));

        f.engine.play().unwrap();
        let mut buffer = vec![ 0.0; 256 ];
        f.engine.render( &mut buffer, 2 );
        assert_eq!( seen.load( Ordering::SeqCst ), 128 );

        f.engine.set_analysis_callback( None );
        f.engine.render( &mut buffer, 2 );
        assert_eq!( seen.load( Ordering::SeqCst ), 128 );
    }


    #[test]
    fn test_progress_reported_while_playing() {
        let mut cfg = config( 1000 );
        cfg.progress_interval = Duration::from_millis( 10 );
        let f = build( cfg, &[ ( "a", 100_000 ) ], &[], None );

        f.engine.play().unwrap();
        let deadline = Instant::now() + Duration::from_secs( 5 );
        while f.count( EventKind::PlaybackProgress ) < 2 && Instant::now() < deadline {
            thread::sleep( Duration::from_millis( 5 ) );
        }
        assert!( f.count( EventKind::PlaybackProgress ) >= 2 );

        f.engine.stop().unwrap();
        let after_stop = f.count( EventKind::PlaybackProgress );
        thread::sleep( Duration::from_millis( 50 ) );
        assert_eq!( f.count( EventKind::PlaybackProgress ), after_stop );
    }


    #[test]
    fn test_event_worker_runs_transitions() {
        let mut cfg = config( 1000 );
        cfg.event_thread = true;
        let f = build( cfg, &[ ( "a", 100 ), ( "b", 10_000 ) ], &[], None );
        f.engine.play().unwrap();

        let mut buffer = vec![ 0.0; 512 ];
        f.engine.render( &mut buffer, 2 );

        let deadline = Instant::now() + Duration::from_secs( 5 );
        while f.current_id().as_deref() != Some( "b" ) && Instant::now() < deadline {
            thread::sleep( Duration::from_millis( 5 ) );
        }
        assert_eq!( f.current_id().as_deref(), Some( "b" ) );

        f.engine.shutdown();
        f.engine.shutdown();
        assert!( !f.engine.is_device_available() );
        assert!( matches!( f.engine.play(), Err( EngineError::DeviceUnavailable ) ) );
    }


    #[test]
    fn test_queue_edits_notify() {
        let f = fixture( &[ ( "a", 100 ), ( "b", 100 ), ( "c", 100 ) ] );

        f.engine.edit_queue( |q| q.add( local_track( "d" ) ) );
        assert!( f.engine.toggle_shuffle() );
        assert!( f.engine.is_shuffled() );
        f.engine.set_shuffle( false );
        assert!( !f.engine.is_shuffled() );

        assert_eq!( f.count( EventKind::QueueChanged ), 3 );
        assert_eq!( f.engine.queue().read().unwrap().len(), 4 );
    }


    #[test]
    fn test_save_and_load_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "queue.json" );

        let f = fixture( &[ ( "a", 100 ), ( "b", 100 ) ] );
        f.engine.play_index( 1 ).unwrap();
        f.engine.save_queue( &path ).unwrap();

        f.engine.edit_queue( |q| q.clear() );
        f.engine.load_queue( &path ).unwrap();

        let queue = f.engine.queue();
        let queue = queue.read().unwrap();
        assert_eq!( queue.len(), 2 );
        assert_eq!( queue.current().map( |t| t.id.as_str() ), Some( "b" ) );
    }


    #[test]
    fn test_play_index_out_of_range() {
        let f = fixture( &[ ( "a", 100 ) ] );
        assert!( !f.engine.play_index( 5 ).unwrap() );
        assert_eq!( f.engine.state(), PlaybackState::Stopped );
    }


    #[test]
    fn test_stop_while_progress_subscriber_calls_engine() {
        let mut cfg = config( 1000 );
        cfg.progress_interval = Duration::from_millis( 10 );
        let f = build( cfg, &[ ( "a", 100_000 ) ], &[], None );

        let entered = Arc::new( AtomicBool::new( false ) );
        let flag = Arc::clone( &entered );
        let engine = Arc::downgrade( &f.engine );
        f.engine.hub().subscribe( EventKind::PlaybackProgress, move |_| {
            if flag.swap( true, Ordering::SeqCst ) {
                return;
            }
            thread::sleep( Duration::from_millis( 100 ) );
            if let Some( engine ) = engine.upgrade() {
                let _ = engine.pause();
            }
        });

        f.engine.play().unwrap();
        let deadline = Instant::now() + Duration::from_secs( 5 );
        while !entered.load( Ordering::SeqCst ) && Instant::now() < deadline {
            thread::sleep( Duration::from_millis( 2 ) );
        }
        assert!( entered.load( Ordering::SeqCst ) );

        let ( done_tx, done_rx ) = bounded( 1 );
        let engine = Arc::clone( &f.engine );
        thread::spawn( move || {
            let _ = engine.stop();
            let _ = done_tx.send( () );
        });

        assert!( done_rx.recv_timeout( Duration::from_secs( 3 ) ).is_ok(), "stop() did not return" );
        assert_eq!( f.engine.state(), PlaybackState::Stopped );
        assert_eq!( f.count( EventKind::PlaybackStopped ), 1 );
    }


    #[test]
    fn test_posted_events_and_track_end_are_both_handled() {
        let f = fixture( &[ ( "a", 100 ), ( "b", 1000 ) ] );
        f.engine.play().unwrap();
        f.clear_events();

        assert!( f.engine.hub().post( Event::QueueChanged ) );
        let mut buffer = vec![ 0.0; 512 ];
        for _ in 0..100 {
            f.engine.render( &mut buffer, 2 );
            if f.engine.hub().pending() > 1 {
                break;
            }
        }
        assert_eq!( f.engine.hub().pending(), 2 );

        assert_eq!( f.engine.process_deferred(), 2 );
        assert_eq!( f.current_id().as_deref(), Some( "b" ) );
        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.kinds()[ ..2 ].to_vec(), vec![ EventKind::QueueChanged, EventKind::TrackEnded ] );
    }


    #[test]
    fn test_concurrent_stops_and_track_end_stop_once() {
        for _ in 0..20 {
            let mut cfg = config( 1000 );
            cfg.event_thread = true;
            let f = build( cfg, &[ ( "a", 100 ) ], &[], None );
            f.engine.play().unwrap();

            // Ends the only track; the worker will try to stop as well
            let mut buffer = vec![ 0.0; 512 ];
            for _ in 0..100 {
                f.engine.render( &mut buffer, 2 );
                if f.engine.state() != PlaybackState::Playing || f.engine.hub().pending() > 0 {
                    break;
                }
            }

            thread::scope( |scope| {
                for _ in 0..4 {
                    scope.spawn( || f.engine.stop().unwrap() );
                }
            });
            f.engine.shutdown();

            assert_eq!( f.engine.state(), PlaybackState::Stopped );
            assert_eq!( f.count( EventKind::PlaybackStopped ), 1 );
            assert_eq!( f.opened().len(), 1 );
            assert_eq!( f.opener.closed.load( Ordering::SeqCst ), 1 );
        }
    }


    #[test]
    fn test_concurrent_toggles_each_flip_state() {
        let f = fixture( &[ ( "a", 100_000 ) ] );
        f.engine.play().unwrap();
        f.clear_events();

        thread::scope( |scope| {
            for _ in 0..2 {
                scope.spawn( || f.engine.toggle_play_pause().unwrap() );
            }
        });

        assert_eq!( f.engine.state(), PlaybackState::Playing );
        assert_eq!( f.count( EventKind::PlaybackPaused ), 1 );
        assert_eq!( f.count( EventKind::PlaybackStarted ), 1 );
    }
}
