//! Slash command language
//!
//! Front ends read a line, hand it to `Command::parse` and execute the result
//! against the engine. The leading `/` is optional. Track numbers are typed
//! 1-based and stored 0-based, in the queue's insertion order.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::queue::RepeatMode;


/// Errors from parsing or running a command.
#[derive( Debug, Error )]
pub enum CommandError {
    #[error( "Unknown command: {0} (try /help)" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "/{0} needs {1}" )]
    MissingArgument( &'static str, &'static str ),

    #[error( "{0}" )]
    ExecutionFailed( String ),
}


#[derive( Debug, Clone, PartialEq )]
pub enum Command {
    Add { path: PathBuf },
    /// Insertion-order index
    Remove { index: usize },
    Clear,
    Move { from: usize, to: usize },
    Jump { index: usize },
    Shuffle,
    /// `None` cycles to the next mode
    Repeat { mode: Option<RepeatMode> },
    List,
    Save { path: Option<PathBuf> },
    Load { path: Option<PathBuf> },

    /// Remember a music folder
    Watch { path: PathBuf },
    /// Queue everything in the remembered folders
    Scan,
    Export { target: PlaylistTarget },
    Import { target: PlaylistTarget },
    Playlists,

    Play,
    Pause,
    Toggle,
    Stop,
    Next,
    Prev,
    Seek { position: Duration },
    /// Percent; `None` just reports
    Volume { level: Option<u32> },
    Status,

    Help,
    Quit,
}


/// Where `/export` writes and `/import` reads.
#[derive( Debug, Clone, PartialEq )]
pub enum PlaylistTarget {
    /// An explicit `.m3u` file
    File( PathBuf ),
    /// A name in the playlist folder
    Named( String ),
}


impl PlaylistTarget {
    /// Anything with a path separator or an M3U extension is a file.
    pub fn parse( s: &str ) -> Self {
        let path = PathBuf::from( s );
        let m3u = path.extension()
            .and_then( |e| e.to_str() )
            .is_some_and( |e| e.eq_ignore_ascii_case( "m3u" ) || e.eq_ignore_ascii_case( "m3u8" ) );

        if m3u || s.contains( '/' ) || s.contains( std::path::MAIN_SEPARATOR ) {
            PlaylistTarget::File( path )
        } else {
            PlaylistTarget::Named( s.to_string() )
        }
    }
}


/// Verb, aliases, usage and summary, in help order. An empty verb starts a
/// new help section named by the summary.
const VERBS: &[( &str, &[&str], &str, &str )] = &[
    ( "", &[], "", "Queue" ),
    ( "add", &[ "a" ], "<path>", "Queue a file or folder" ),
    ( "remove", &[ "rm" ], "<n>", "Remove track n" ),
    ( "clear", &[], "", "Empty the queue" ),
    ( "move", &[ "mv" ], "<n> <m>", "Move track n to slot m" ),
    ( "jump", &[ "j", "goto" ], "<n>", "Play track n" ),
    ( "shuffle", &[ "sh" ], "", "Toggle shuffle" ),
    ( "repeat", &[ "r" ], "[off|one|all]", "Set or cycle repeat" ),
    ( "list", &[ "ls", "queue" ], "", "Show the queue" ),
    ( "save", &[], "[file]", "Save the queue" ),
    ( "load", &[], "[file]", "Load a saved queue" ),
    ( "", &[], "", "Library" ),
    ( "watch", &[], "<folder>", "Remember a music folder" ),
    ( "scan", &[], "", "Queue every remembered folder" ),
    ( "export", &[], "<name|file.m3u>", "Write the queue as a playlist" ),
    ( "import", &[], "<name|file.m3u>", "Queue a playlist" ),
    ( "playlists", &[ "pl" ], "", "List saved playlists" ),
    ( "", &[], "", "Playback" ),
    ( "play", &[ "p" ], "", "Start or resume" ),
    ( "pause", &[], "", "Pause" ),
    ( "toggle", &[ "t", "space" ], "", "Play/pause" ),
    ( "stop", &[ "s" ], "", "Stop and unload" ),
    ( "next", &[ "n" ], "", "Next track" ),
    ( "prev", &[ "previous", "b" ], "", "Previous track" ),
    ( "seek", &[], "<[h:]m:ss|secs>", "Jump within the track" ),
    ( "vol", &[ "volume", "v" ], "[0-100]", "Show or set volume" ),
    ( "status", &[ "now" ], "", "What is playing" ),
    ( "", &[], "", "Other" ),
    ( "help", &[ "h", "?" ], "", "This text" ),
    ( "quit", &[ "q", "exit" ], "", "Leave cadence" ),
];


/// Maps an alias to its verb.
fn canonical( word: &str ) -> Option<&'static str> {
    VERBS.iter()
        .filter( |( verb, ..)| !verb.is_empty() )
        .find( |( verb, aliases, ..)| *verb == word || aliases.contains( &word ) )
        .map( |( verb, ..)| *verb )
}


impl Command {
    /// Parses one input line.
    ///
    /// @param input - e.g. `/seek 1:30` or `vol 40`
    ///
    /// @returns The command, or why it was rejected
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let line = input.trim();
        let line = line.strip_prefix( '/' ).unwrap_or( line );

        let ( word, rest ) = match line.split_once( char::is_whitespace ) {
            Some(( word, rest )) => ( word, rest.trim() ),
            None => ( line, "" ),
        };
        let word = word.to_lowercase();
        let arg = ( !rest.is_empty() ).then_some( rest );

        let verb = canonical( &word )
            .ok_or_else( || CommandError::Unknown( if word.is_empty() { "(empty)".into() } else { word.clone() } ) )?;
        let need = |what: &'static str| arg.ok_or( CommandError::MissingArgument( verb, what ) );

        let command = match verb {
            "add" => Command::Add { path: PathBuf::from( need( "a path" )? ) },
            "remove" => Command::Remove { index: track_number( need( "a track number" )? )? },
            "clear" => Command::Clear,
            "move" => {
                let mut numbers = need( "two track numbers" )?.split_whitespace();
                let ( Some( from ), Some( to ), None ) = ( numbers.next(), numbers.next(), numbers.next() ) else {
                    return Err( CommandError::MissingArgument( verb, "two track numbers" ) );
                };
                Command::Move { from: track_number( from )?, to: track_number( to )? }
            }
            "jump" => Command::Jump { index: track_number( need( "a track number" )? )? },
            "shuffle" => Command::Shuffle,
            "repeat" => Command::Repeat {
                mode: arg.map( str::parse::<RepeatMode> ).transpose().map_err( CommandError::InvalidArgument )?,
            },
            "list" => Command::List,
            "save" => Command::Save { path: arg.map( PathBuf::from ) },
            "load" => Command::Load { path: arg.map( PathBuf::from ) },
            "watch" => Command::Watch { path: PathBuf::from( need( "a folder" )? ) },
            "scan" => Command::Scan,
            "export" => Command::Export { target: PlaylistTarget::parse( need( "a name or file" )? ) },
            "import" => Command::Import { target: PlaylistTarget::parse( need( "a name or file" )? ) },
            "playlists" => Command::Playlists,
            "play" => Command::Play,
            "pause" => Command::Pause,
            "toggle" => Command::Toggle,
            "stop" => Command::Stop,
            "next" => Command::Next,
            "prev" => Command::Prev,
            "seek" => Command::Seek { position: parse_time( need( "a time" )? )? },
            "vol" => Command::Volume { level: arg.map( volume_percent ).transpose()? },
            "status" => Command::Status,
            "help" => Command::Help,
            _ => Command::Quit,
        };

        Ok( command )
    }
}


fn track_number( s: &str ) -> Result<usize, CommandError> {
    s.parse::<usize>()
        .ok()
        .and_then( |n| n.checked_sub( 1 ) )
        .ok_or_else( || CommandError::InvalidArgument( format!( "'{}' is not a track number", s ) ) )
}


fn volume_percent( s: &str ) -> Result<u32, CommandError> {
    s.trim_end_matches( '%' )
        .parse::<u32>()
        .ok()
        .filter( |v| *v <= 100 )
        .ok_or_else( || CommandError::InvalidArgument( format!( "volume '{}' is not 0-100", s ) ) )
}


/// Parses `90`, `1:30` or `1:02:03`.
///
/// Every field after the first must be below 60.
pub fn parse_time( s: &str ) -> Result<Duration, CommandError> {
    let invalid = || CommandError::InvalidArgument( format!( "'{}' is not a time", s ) );

    let fields: Vec<&str> = s.trim().split( ':' ).collect();
    if fields.len() > 3 {
        return Err( invalid() );
    }

    let mut total = 0u64;
    for ( i, field ) in fields.iter().enumerate() {
        let value: u64 = field.parse().map_err( |_| invalid() )?;
        if i > 0 && value >= 60 {
            return Err( invalid() );
        }
        total = total * 60 + value;
    }

    Ok( Duration::from_secs( total ) )
}


/// Formats as `M:SS`, or `H:MM:SS` from an hour up.
pub fn format_time( d: Duration ) -> String {
    let secs = d.as_secs();
    let ( hours, mins, secs ) = ( secs / 3600, secs / 60 % 60, secs % 60 );
    if hours > 0 {
        format!( "{}:{:02}:{:02}", hours, mins, secs )
    } else {
        format!( "{}:{:02}", mins, secs )
    }
}


/// Help text built from the verb table.
pub fn help_text() -> String {
    let mut text = String::new();
    for ( verb, aliases, usage, summary ) in VERBS {
        if verb.is_empty() {
            if !text.is_empty() {
                text.push( '\n' );
            }
            text.push_str( summary );
            text.push_str( ":\n" );
            continue;
        }

        let call = format!( "/{} {}", verb, usage );
        let aliases = if aliases.is_empty() {
            String::new()
        } else {
            format!( " (/{})", aliases.join( ", /" ) )
        };
        text.push_str( &format!( "  {:<26}{}{}\n", call.trim_end(), summary, aliases ) );
    }
    text
}


#[cfg( test )]
mod tests {
    use super::*;


    fn rejected( input: &str ) -> CommandError {
        Command::parse( input ).unwrap_err()
    }


    #[test]
    fn test_slash_and_aliases() {
        assert_eq!( Command::parse( "/a ~/Music/album" ).unwrap(), Command::Add { path: PathBuf::from( "~/Music/album" ) } );
        assert_eq!( Command::parse( "ADD song.flac" ).unwrap(), Command::Add { path: PathBuf::from( "song.flac" ) } );
        assert_eq!( Command::parse( "/b" ).unwrap(), Command::Prev );
        assert_eq!( Command::parse( "  space " ).unwrap(), Command::Toggle );
        assert_eq!( Command::parse( "exit" ).unwrap(), Command::Quit );
    }


    #[test]
    fn test_paths_keep_spaces() {
        let cmd = Command::parse( "/add /music/Some Artist/01 Intro.mp3" ).unwrap();
        assert_eq!( cmd, Command::Add { path: PathBuf::from( "/music/Some Artist/01 Intro.mp3" ) } );
    }


    #[test]
    fn test_track_numbers() {
        assert_eq!( Command::parse( "rm 3" ).unwrap(), Command::Remove { index: 2 } );
        assert_eq!( Command::parse( "goto 1" ).unwrap(), Command::Jump { index: 0 } );
        assert_eq!( Command::parse( "mv 4   2" ).unwrap(), Command::Move { from: 3, to: 1 } );

        assert!( matches!( rejected( "jump 0" ), CommandError::InvalidArgument( _ ) ) );
        assert!( matches!( rejected( "jump -2" ), CommandError::InvalidArgument( _ ) ) );
        assert!( matches!( rejected( "move 4" ), CommandError::MissingArgument( "move", _ ) ) );
        assert!( matches!( rejected( "move 1 2 3" ), CommandError::MissingArgument( "move", _ ) ) );
    }


    #[test]
    fn test_missing_arguments_name_the_verb() {
        assert_eq!( rejected( "a" ).to_string(), "/add needs a path" );
        assert!( matches!( rejected( "seek" ), CommandError::MissingArgument( "seek", _ ) ) );
    }


    #[test]
    fn test_unknown() {
        assert!( matches!( rejected( "/dance" ), CommandError::Unknown( w ) if w == "dance" ) );
        assert!( matches!( rejected( "   " ), CommandError::Unknown( _ ) ) );
    }


    #[test]
    fn test_repeat() {
        assert_eq!( Command::parse( "repeat" ).unwrap(), Command::Repeat { mode: None } );
        assert_eq!( Command::parse( "r one" ).unwrap(), Command::Repeat { mode: Some( RepeatMode::One ) } );
        assert!( matches!( rejected( "repeat twice" ), CommandError::InvalidArgument( _ ) ) );
    }


    #[test]
    fn test_volume() {
        assert_eq!( Command::parse( "v 40" ).unwrap(), Command::Volume { level: Some( 40 ) } );
        assert_eq!( Command::parse( "vol 100%" ).unwrap(), Command::Volume { level: Some( 100 ) } );
        assert_eq!( Command::parse( "volume" ).unwrap(), Command::Volume { level: None } );
        assert!( Command::parse( "vol 101" ).is_err() );
        assert!( Command::parse( "vol loud" ).is_err() );
    }


    #[test]
    fn test_save_and_load_paths() {
        assert_eq!( Command::parse( "save" ).unwrap(), Command::Save { path: None } );
        assert_eq!(
            Command::parse( "load /tmp/q.json" ).unwrap(),
            Command::Load { path: Some( PathBuf::from( "/tmp/q.json" ) ) }
        );
    }


    #[test]
    fn test_library_and_playlist_verbs() {
        assert_eq!( Command::parse( "/watch ~/Music" ).unwrap(), Command::Watch { path: PathBuf::from( "~/Music" ) } );
        assert_eq!( Command::parse( "scan" ).unwrap(), Command::Scan );
        assert_eq!( Command::parse( "/pl" ).unwrap(), Command::Playlists );
        assert_eq!(
            Command::parse( "/export Road Trip" ).unwrap(),
            Command::Export { target: PlaylistTarget::Named( "Road Trip".into() ) }
        );
        assert_eq!(
            Command::parse( "import mix.M3U8" ).unwrap(),
            Command::Import { target: PlaylistTarget::File( PathBuf::from( "mix.M3U8" ) ) }
        );
        assert_eq!(
            Command::parse( "import ../lists/party" ).unwrap(),
            Command::Import { target: PlaylistTarget::File( PathBuf::from( "../lists/party" ) ) }
        );
        assert!( matches!( rejected( "export" ), CommandError::MissingArgument( "export", _ ) ) );
    }


    #[test]
    fn test_parse_time() {
        assert_eq!( parse_time( "45" ).unwrap(), Duration::from_secs( 45 ) );
        assert_eq!( parse_time( "1:30" ).unwrap(), Duration::from_secs( 90 ) );
        assert_eq!( parse_time( "1:02:03" ).unwrap(), Duration::from_secs( 3723 ) );
        assert_eq!( parse_time( "125" ).unwrap(), Duration::from_secs( 125 ) );

        for bad in [ "1:75", "1:60:00", "soon", "1::2", "1:2:3:4", "" ] {
            assert!( parse_time( bad ).is_err(), "{}", bad );
        }
    }


    #[test]
    fn test_seek_command() {
        assert_eq!( Command::parse( "seek 2:05" ).unwrap(), Command::Seek { position: Duration::from_secs( 125 ) } );
    }


    #[test]
    fn test_format_time() {
        assert_eq!( format_time( Duration::ZERO ), "0:00" );
        assert_eq!( format_time( Duration::from_millis( 185_900 ) ), "3:05" );
        assert_eq!( format_time( Duration::from_secs( 3723 ) ), "1:02:03" );
    }


    #[test]
    fn test_help_lists_every_verb() {
        let help = help_text();
        for ( verb, .. ) in VERBS.iter().filter( |( v, ..)| !v.is_empty() ) {
            assert!( help.contains( &format!( "/{}", verb ) ), "{}", verb );
            assert_eq!( canonical( verb ), Some( *verb ) );
        }
        assert!( help.starts_with( "Queue:" ) );
    }
}
