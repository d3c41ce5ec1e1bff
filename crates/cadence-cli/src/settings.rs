//! Application settings management
//!
//! Persists the listener's volume, repeat mode and queue preferences between runs.

use std::fs;
use std::path::{ Path, PathBuf };

use serde::{ Deserialize, Serialize };

use cadence_core::{ LibraryScanner, RepeatMode };


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Volume level (0.0 to 1.0)
    pub volume: f32,

    pub repeat: RepeatMode,

    /// Reload the last queue on startup and save it on exit
    pub restore_queue: bool,

    /// Where cached remote tracks live; the user cache directory when unset
    pub cache_dir: Option<PathBuf>,

    /// Music folders picked up by /scan
    pub library: Vec<PathBuf>,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            volume: 0.8,
            repeat: RepeatMode::Off,
            restore_queue: true,
            cache_dir: None,
            library: Vec::new(),
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "cadence" ).join( "settings.json" ) )
    }


    /// Remembers a music folder. Returns false if it was already known.
    pub fn watch_folder( &mut self, folder: PathBuf ) -> bool {
        if self.library.contains( &folder ) {
            return false;
        }
        self.library.push( folder );
        true
    }


    /// A scanner over the remembered folders.
    pub fn scanner( &self ) -> LibraryScanner {
        let mut scanner = LibraryScanner::new();
        for folder in &self.library {
            scanner.add_root( folder.clone() );
        }
        scanner
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some( path ) => Self::load_from( &path ),
            None => Self::default(),
        }
    }


    /// Loads settings from a specific file, falling back to defaults.
    pub fn load_from( path: &Path ) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( path ) {
            Ok( contents ) => serde_json::from_str( &contents ).unwrap_or_else( |e| {
                tracing::warn!( "Ignoring invalid settings file {:?}: {}", path, e );
                Self::default()
            }),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Saves settings to disk.
    pub fn save( &self ) {
        if let Some( path ) = Self::settings_path() {
            self.save_to( &path );
        }
    }


    /// Saves settings to a specific file.
    pub fn save_to( &self, path: &Path ) {
        // Create parent directory if needed
        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "cadence" ).join( "settings.json" );

        let settings = Settings {
            volume: 0.3,
            repeat: RepeatMode::All,
            restore_queue: false,
            cache_dir: Some( PathBuf::from( "/tmp/cache" ) ),
            library: vec![ PathBuf::from( "/music" ) ],
        };
        settings.save_to( &path );

        assert_eq!( Settings::load_from( &path ), settings );
    }


    #[test]
    fn test_missing_and_corrupt_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        assert_eq!( Settings::load_from( &path ), Settings::default() );

        fs::write( &path, "volume = loud" ).unwrap();
        assert_eq!( Settings::load_from( &path ), Settings::default() );
    }


    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, r#"{ "volume": 0.5 }"# ).unwrap();

        let settings = Settings::load_from( &path );
        assert_eq!( settings.volume, 0.5 );
        assert!( settings.restore_queue );
    }


    #[test]
    fn test_watched_folders_feed_the_scanner() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all( dir.path().join( "jazz" ) ).unwrap();
        fs::write( dir.path().join( "jazz/take five.flac" ), b"" ).unwrap();
        fs::write( dir.path().join( "readme.txt" ), b"" ).unwrap();

        let mut settings = Settings::default();
        assert!( settings.scanner().roots().is_empty() );
        assert!( settings.watch_folder( dir.path().to_path_buf() ) );
        assert!( !settings.watch_folder( dir.path().to_path_buf() ) );

        let tracks = settings.scanner().scan().unwrap();
        assert_eq!( tracks.len(), 1 );
        assert_eq!( tracks[ 0 ].title, "take five" );
    }
}
