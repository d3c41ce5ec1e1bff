//! Local music folders
//!
//! Turns watched folders, or a single path typed by the user, into queueable
//! tracks. Only regular files with a known audio extension are picked up.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{ Path, PathBuf };

use thiserror::Error;

use crate::track::TrackInfo;


/// Extensions (lowercase) the decoder is expected to handle.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "flac", "ogg", "oga", "opus", "wav", "wave",
];


#[derive( Debug, Error )]
pub enum LibraryError {
    #[error( "No such file or folder: {0}" )]
    NotFound( PathBuf ),

    #[error( "Cannot read {0}: {1}" )]
    Io( PathBuf, #[source] io::Error ),
}


/// A set of watched folders.
#[derive( Debug, Default )]
pub struct LibraryScanner {
    folders: Vec<PathBuf>,
}


impl LibraryScanner {
    pub fn new() -> Self {
        Self::default()
    }


    /// Starts watching `folder`. Returns false if it already was.
    pub fn add_root( &mut self, folder: PathBuf ) -> bool {
        if self.folders.contains( &folder ) {
            return false;
        }
        self.folders.push( folder );
        true
    }


    pub fn remove_root( &mut self, folder: &Path ) -> bool {
        let before = self.folders.len();
        self.folders.retain( |f| f != folder );
        self.folders.len() != before
    }


    pub fn roots( &self ) -> &[PathBuf] {
        &self.folders
    }


    /// Walks every watched folder.
    ///
    /// Folders that have gone missing are skipped. A file reachable from two
    /// overlapping folders is listed once. Results are ordered by path.
    pub fn scan( &self ) -> Result<Vec<TrackInfo>, LibraryError> {
        let mut found = BTreeMap::new();

        for folder in &self.folders {
            if !folder.is_dir() {
                tracing::warn!( "Watched folder {:?} is not available, skipping", folder );
                continue;
            }
            tracing::debug!( "Scanning {:?}", folder );
            walk( folder, &mut found )?;
        }

        tracing::info!( "Library scan found {} tracks in {} folders", found.len(), self.folders.len() );
        Ok( found.into_values().collect() )
    }
}


/// Expands one user-supplied path: a folder is walked, a file becomes a
/// single track whatever its extension (the decoder decides).
pub fn tracks_from_path( path: &Path ) -> Result<Vec<TrackInfo>, LibraryError> {
    if path.is_file() {
        return Ok( vec![ TrackInfo::from_path( path ) ] );
    }
    if !path.is_dir() {
        return Err( LibraryError::NotFound( path.to_path_buf() ) );
    }

    let mut found = BTreeMap::new();
    walk( path, &mut found )?;
    Ok( found.into_values().collect() )
}


/// Depth-first walk without recursion. Unreadable subfolders are skipped; an
/// unreadable top folder is an error.
fn walk( top: &Path, found: &mut BTreeMap<PathBuf, TrackInfo> ) -> Result<(), LibraryError> {
    let mut pending = vec![ top.to_path_buf() ];

    while let Some( dir ) = pending.pop() {
        let entries = match fs::read_dir( &dir ) {
            Ok( entries ) => entries,
            Err( e ) if dir == top => return Err( LibraryError::Io( dir, e ) ),
            Err( e ) => {
                tracing::warn!( "Skipping {:?}: {}", dir, e );
                continue;
            }
        };

        for entry in entries.flatten() {
            let Ok( kind ) = entry.file_type() else { continue };
            let path = entry.path();

            if kind.is_dir() {
                pending.push( path );
            } else if kind.is_file() && is_audio_file( &path ) {
                found.entry( path.clone() ).or_insert_with( || TrackInfo::from_path( path ) );
            }
        }
    }

    Ok(())
}


pub fn is_audio_file( path: &Path ) -> bool {
    let Some( ext ) = path.extension().and_then( |e| e.to_str() ) else {
        return false;
    };
    SUPPORTED_EXTENSIONS.iter().any( |s| s.eq_ignore_ascii_case( ext ) )
}


#[cfg( test )]
mod tests {
    use super::*;

    use crate::track::AudioFormat;


    fn touch( path: &Path ) {
        if let Some( parent ) = path.parent() {
            fs::create_dir_all( parent ).unwrap();
        }
        fs::write( path, b"" ).unwrap();
    }


    #[test]
    fn test_scan_walks_subfolders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        touch( &dir.path().join( "b.mp3" ) );
        touch( &dir.path().join( "album/disc 2/a.FLAC" ) );
        touch( &dir.path().join( "album/cover.jpg" ) );
        touch( &dir.path().join( "notes" ) );

        let mut scanner = LibraryScanner::new();
        assert!( scanner.add_root( dir.path().to_path_buf() ) );
        assert!( !scanner.add_root( dir.path().to_path_buf() ) );

        let tracks = scanner.scan().unwrap();
        let titles: Vec<_> = tracks.iter().map( |t| t.title.as_str() ).collect();
        assert_eq!( titles, vec![ "a", "b" ] );
        assert_eq!( tracks[ 0 ].format, AudioFormat::Flac );
    }


    #[test]
    fn test_overlapping_roots_list_files_once() {
        let dir = tempfile::tempdir().unwrap();
        touch( &dir.path().join( "rock/song.ogg" ) );

        let mut scanner = LibraryScanner::new();
        scanner.add_root( dir.path().to_path_buf() );
        scanner.add_root( dir.path().join( "rock" ) );

        assert_eq!( scanner.scan().unwrap().len(), 1 );
    }


    #[test]
    fn test_missing_root_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch( &dir.path().join( "x.wav" ) );

        let mut scanner = LibraryScanner::new();
        scanner.add_root( PathBuf::from( "/definitely/not/here" ) );
        scanner.add_root( dir.path().to_path_buf() );
        assert_eq!( scanner.scan().unwrap().len(), 1 );

        assert!( scanner.remove_root( Path::new( "/definitely/not/here" ) ) );
        assert!( !scanner.remove_root( Path::new( "/definitely/not/here" ) ) );
        assert_eq!( scanner.roots().len(), 1 );
    }


    #[test]
    fn test_tracks_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join( "song.ogg" );
        touch( &file );

        let tracks = tracks_from_path( &file ).unwrap();
        assert_eq!( tracks.len(), 1 );
        assert_eq!( tracks[ 0 ].path.as_deref(), Some( file.as_path() ) );

        assert_eq!( tracks_from_path( dir.path() ).unwrap().len(), 1 );
        assert!( matches!( tracks_from_path( &dir.path().join( "gone" ) ), Err( LibraryError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_is_audio_file() {
        assert!( is_audio_file( Path::new( "a/b/Track.OPUS" ) ) );
        assert!( !is_audio_file( Path::new( "a/b/cover.png" ) ) );
        assert!( !is_audio_file( Path::new( "a/b/mp3" ) ) );
    }
}
