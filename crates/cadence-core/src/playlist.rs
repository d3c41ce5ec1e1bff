//! M3U playlists
//!
//! Reads and writes extended M3U: an `#EXTM3U` header, an optional
//! `#PLAYLIST:` name, and per entry an `#EXTINF:<secs>,<label>` line followed
//! by a path or a remote handle. Plain M3U files (paths only) load as well.

use std::fs::{ self, File };
use std::io::{ self, BufRead, BufReader, BufWriter, Write };
use std::path::{ Path, PathBuf };
use std::time::Duration;

use thiserror::Error;

use crate::track::TrackInfo;


const HEADER: &str = "#EXTM3U";
const NAME_TAG: &str = "#PLAYLIST:";
const INFO_TAG: &str = "#EXTINF:";


#[derive( Debug, Error )]
pub enum PlaylistError {
    #[error( "I/O error: {0}" )]
    Io( #[from] io::Error ),

    #[error( "No playlist named '{0}'" )]
    NotFound( String ),

    #[error( "'{0}' is not a usable playlist name" )]
    InvalidName( String ),
}


/// A named, ordered list of tracks.
#[derive( Debug, Clone, PartialEq )]
pub struct Playlist {
    pub name: String,
    pub tracks: Vec<TrackInfo>,
}


impl Playlist {
    pub fn new( name: impl Into<String>, tracks: Vec<TrackInfo> ) -> Self {
        Self { name: name.into(), tracks }
    }


    /// Writes the playlist as extended M3U.
    ///
    /// Tracks with neither a path nor a remote handle are skipped.
    pub fn write_m3u( &self, path: &Path ) -> Result<(), PlaylistError> {
        let mut out = BufWriter::new( File::create( path )? );

        writeln!( out, "{}", HEADER )?;
        writeln!( out, "{}{}", NAME_TAG, self.name )?;

        let mut written = 0;
        for track in &self.tracks {
            let location = match ( &track.path, &track.remote ) {
                ( Some( p ), _ ) => p.to_string_lossy().into_owned(),
                ( None, Some( handle ) ) => handle.clone(),
                ( None, None ) => continue,
            };

            let secs = if track.duration.is_zero() { -1 } else { track.duration.as_secs() as i64 };
            writeln!( out, "{}{},{}", INFO_TAG, secs, track.label() )?;
            writeln!( out, "{}", location )?;
            written += 1;
        }

        out.flush()?;
        tracing::info!( "Wrote {} tracks to {:?}", written, path );
        Ok(())
    }


    /// Reads an M3U or extended M3U file.
    ///
    /// The name comes from `#PLAYLIST:` when present, otherwise from the file
    /// stem. Relative entries are resolved against the playlist's folder and
    /// entries containing `://` become remote tracks.
    pub fn read_m3u( path: &Path ) -> Result<Self, PlaylistError> {
        let reader = BufReader::new( File::open( path )? );
        let base = path.parent().unwrap_or( Path::new( "" ) );

        let mut name = path.file_stem()
            .map( |s| s.to_string_lossy().into_owned() )
            .unwrap_or_default();
        let mut tracks = Vec::new();
        let mut info: Option<( Duration, String )> = None;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() {
                continue;
            }
            if let Some( rest ) = line.strip_prefix( NAME_TAG ) {
                name = rest.trim().to_string();
                continue;
            }
            if let Some( rest ) = line.strip_prefix( INFO_TAG ) {
                info = Some( parse_info( rest ) );
                continue;
            }
            if line.starts_with( '#' ) {
                continue;
            }

            let mut track = if line.contains( "://" ) {
                TrackInfo::remote( line, line )
            } else {
                let entry = Path::new( line );
                if entry.is_absolute() {
                    TrackInfo::from_path( entry )
                } else {
                    TrackInfo::from_path( base.join( entry ) )
                }
            };

            if let Some(( duration, label )) = info.take() {
                track.duration = duration;
                match label.split_once( " - " ) {
                    Some(( artist, title )) => {
                        track.artist = artist.to_string();
                        track.title = title.to_string();
                    }
                    None if !label.is_empty() => track.title = label,
                    None => {}
                }
            }
            tracks.push( track );
        }

        tracing::info!( "Read {} tracks from {:?}", tracks.len(), path );
        Ok( Self { name, tracks } )
    }
}


/// Splits `<secs>,<label>`. Negative or unparsable lengths mean unknown.
fn parse_info( rest: &str ) -> ( Duration, String ) {
    let ( secs, label ) = rest.split_once( ',' ).unwrap_or(( rest, "" ));
    let duration = secs.trim()
        .parse::<i64>()
        .ok()
        .filter( |s| *s > 0 )
        .map( |s| Duration::from_secs( s as u64 ) )
        .unwrap_or_default();
    ( duration, label.trim().to_string() )
}


/// Named playlists stored as `<name>.m3u` in one folder.
#[derive( Debug, Clone )]
pub struct PlaylistManager {
    dir: PathBuf,
}


impl PlaylistManager {
    pub fn new( dir: impl Into<PathBuf> ) -> Self {
        Self { dir: dir.into() }
    }


    /// `~/.local/share/cadence/playlists` on Linux.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map( |d| d.join( "cadence" ).join( "playlists" ) )
    }


    pub fn dir( &self ) -> &Path {
        &self.dir
    }


    fn path_for( &self, name: &str ) -> Result<PathBuf, PlaylistError> {
        let name = name.trim();
        let bad = name.is_empty()
            || name.starts_with( '.' )
            || name.chars().any( |c| matches!( c, '/' | '\\' | ':' ) || c.is_control() );
        if bad {
            return Err( PlaylistError::InvalidName( name.to_string() ) );
        }
        Ok( self.dir.join( format!( "{}.m3u", name ) ) )
    }


    /// Saves under the playlist's own name, replacing any earlier copy.
    pub fn save( &self, playlist: &Playlist ) -> Result<PathBuf, PlaylistError> {
        let path = self.path_for( &playlist.name )?;
        fs::create_dir_all( &self.dir )?;
        playlist.write_m3u( &path )?;
        Ok( path )
    }


    pub fn load( &self, name: &str ) -> Result<Playlist, PlaylistError> {
        let path = self.path_for( name )?;
        if !path.is_file() {
            return Err( PlaylistError::NotFound( name.to_string() ) );
        }
        Playlist::read_m3u( &path )
    }


    /// Saved playlist names, sorted.
    pub fn list( &self ) -> Result<Vec<String>, PlaylistError> {
        let entries = match fs::read_dir( &self.dir ) {
            Ok( entries ) => entries,
            Err( e ) if e.kind() == io::ErrorKind::NotFound => return Ok( Vec::new() ),
            Err( e ) => return Err( e.into() ),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .map( |e| e.path() )
            .filter( |p| p.extension().is_some_and( |ext| ext.eq_ignore_ascii_case( "m3u" ) ) )
            .filter_map( |p| p.file_stem().map( |s| s.to_string_lossy().into_owned() ) )
            .collect();
        names.sort();
        Ok( names )
    }


    pub fn remove( &self, name: &str ) -> Result<(), PlaylistError> {
        let path = self.path_for( name )?;
        match fs::remove_file( &path ) {
            Ok(()) => Ok(()),
            Err( e ) if e.kind() == io::ErrorKind::NotFound => Err( PlaylistError::NotFound( name.to_string() ) ),
            Err( e ) => Err( e.into() ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn tagged( path: &str, artist: &str, title: &str, secs: u64 ) -> TrackInfo {
        let mut track = TrackInfo::from_path( path );
        track.artist = artist.to_string();
        track.title = title.to_string();
        track.duration = Duration::from_secs( secs );
        track
    }


    #[test]
    fn test_write_then_read_keeps_order_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join( "mix.m3u" );

        let playlist = Playlist::new( "Road Trip", vec![
            tagged( "/music/b.flac", "Band", "Second", 200 ),
            TrackInfo::from_path( "/music/a.mp3" ),
            TrackInfo::remote( "r1", "https://cdn.example/r1.opus" ),
        ]);
        playlist.write_m3u( &file ).unwrap();

        let text = fs::read_to_string( &file ).unwrap();
        assert!( text.starts_with( "#EXTM3U\n#PLAYLIST:Road Trip\n" ) );
        assert!( text.contains( "#EXTINF:200,Band - Second\n/music/b.flac\n" ) );
        assert!( text.contains( "#EXTINF:-1,a\n/music/a.mp3\n" ) );

        let read = Playlist::read_m3u( &file ).unwrap();
        assert_eq!( read.name, "Road Trip" );
        assert_eq!( read.tracks.len(), 3 );
        assert_eq!( read.tracks[ 0 ].artist, "Band" );
        assert_eq!( read.tracks[ 0 ].title, "Second" );
        assert_eq!( read.tracks[ 0 ].duration, Duration::from_secs( 200 ) );
        assert_eq!( read.tracks[ 1 ].path.as_deref(), Some( Path::new( "/music/a.mp3" ) ) );
        assert_eq!( read.tracks[ 1 ].duration, Duration::ZERO );
        assert_eq!( read.tracks[ 2 ].path, None );
        assert_eq!( read.tracks[ 2 ].remote.as_deref(), Some( "https://cdn.example/r1.opus" ) );
    }


    #[test]
    fn test_plain_m3u_uses_stem_and_resolves_relative() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join( "chill.m3u" );
        fs::write( &file, "# made by hand\n\nsub/one.ogg\r\n/abs/two.wav\n" ).unwrap();

        let read = Playlist::read_m3u( &file ).unwrap();
        assert_eq!( read.name, "chill" );
        assert_eq!( read.tracks[ 0 ].path, Some( dir.path().join( "sub/one.ogg" ) ) );
        assert_eq!( read.tracks[ 0 ].title, "one" );
        assert_eq!( read.tracks[ 1 ].path.as_deref(), Some( Path::new( "/abs/two.wav" ) ) );
    }


    #[test]
    fn test_manager_save_list_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PlaylistManager::new( dir.path().join( "lists" ) );
        assert!( manager.list().unwrap().is_empty() );

        manager.save( &Playlist::new( "zeta", vec![ TrackInfo::from_path( "/m/z.mp3" ) ] ) ).unwrap();
        manager.save( &Playlist::new( "alpha", vec![] ) ).unwrap();
        assert_eq!( manager.list().unwrap(), vec![ "alpha", "zeta" ] );

        let zeta = manager.load( "zeta" ).unwrap();
        assert_eq!( zeta.tracks.len(), 1 );

        manager.remove( "alpha" ).unwrap();
        assert!( matches!( manager.remove( "alpha" ), Err( PlaylistError::NotFound( _ ) ) ) );
        assert!( matches!( manager.load( "alpha" ), Err( PlaylistError::NotFound( _ ) ) ) );
        assert_eq!( manager.list().unwrap(), vec![ "zeta" ] );
    }


    #[test]
    fn test_names_cannot_escape_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PlaylistManager::new( dir.path() );

        for bad in [ "", "  ", "../up", "a/b", ".hidden", "c:\\x" ] {
            let result = manager.save( &Playlist::new( bad, vec![] ) );
            assert!( matches!( result, Err( PlaylistError::InvalidName( _ ) ) ), "{:?}", bad );
        }
    }
}
