//! Command-line argument parsing for Cadence.

use std::path::PathBuf;

use clap::Parser;


/// Cadence - A line-driven music player.
#[derive( Parser, Debug )]
#[command( name = "cadence" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Play without an audio device; audio is decoded and discarded in real time.
    #[arg( long )]
    pub null_output: bool,

    /// Start with an empty queue instead of the one saved last time.
    #[arg( long )]
    pub no_restore: bool,

    /// Directory holding downloaded copies of remote tracks.
    #[arg( long )]
    pub cache_dir: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides).
    #[arg( short, long )]
    pub verbose: bool,

    /// Add files/directories to the queue and start playing.
    #[arg( trailing_var_arg = true )]
    pub files: Vec<PathBuf>,
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_flags_and_files() {
        let args = Args::parse_from( [ "cadence", "--null-output", "-v", "a.mp3", "music/" ] );
        assert!( args.null_output );
        assert!( args.verbose );
        assert!( !args.no_restore );
        assert_eq!( args.files, vec![ PathBuf::from( "a.mp3" ), PathBuf::from( "music/" ) ] );
    }
}
