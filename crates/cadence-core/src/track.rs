//! Track descriptors
//!
//! A `TrackInfo` is produced by whatever found the content (a library scan,
//! a catalog lookup) and handed to the queue by value.

use std::fmt;
use std::path::{ Path, PathBuf };
use std::str::FromStr;
use std::time::Duration;

use serde::{ Deserialize, Serialize };


/// Container/codec family of a track, as far as the file name tells.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize )]
pub enum AudioFormat {
    #[default]
    Unknown,
    Mp3,
    M4a,
    Flac,
    Ogg,
    Opus,
    Wav,
}


impl AudioFormat {
    /// Detects the format from a file extension.
    pub fn from_path( path: &Path ) -> Self {
        path.extension()
            .and_then( |e| e.to_str() )
            .and_then( |e| e.parse().ok() )
            .unwrap_or_default()
    }
}


impl fmt::Display for AudioFormat {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        let name = match self {
            AudioFormat::Unknown => "Unknown",
            AudioFormat::Mp3 => "MP3",
            AudioFormat::M4a => "M4A",
            AudioFormat::Flac => "FLAC",
            AudioFormat::Ogg => "OGG",
            AudioFormat::Opus => "OPUS",
            AudioFormat::Wav => "WAV",
        };
        f.write_str( name )
    }
}


impl FromStr for AudioFormat {
    type Err = ();


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        match s.trim_start_matches( '.' ).to_lowercase().as_str() {
            "mp3" => Ok( AudioFormat::Mp3 ),
            "m4a" | "aac" => Ok( AudioFormat::M4a ),
            "flac" => Ok( AudioFormat::Flac ),
            "ogg" | "oga" => Ok( AudioFormat::Ogg ),
            "opus" => Ok( AudioFormat::Opus ),
            "wav" | "wave" => Ok( AudioFormat::Wav ),
            _ => Err(()),
        }
    }
}


/// Where the bytes of a track can be found.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
pub enum Locator {
    /// A path the decoder can open directly.
    Local( PathBuf ),
    /// An opaque handle understood by a `SourceResolver` (catalog id, feed entry, ...).
    Remote( String ),
}


/// Immutable description of a playable track.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct TrackInfo {
    pub id: String,
    #[serde( default )]
    pub title: String,
    #[serde( default )]
    pub artist: String,
    #[serde( default )]
    pub album: String,
    #[serde( default )]
    pub duration: Duration,
    /// Primary location, usually a local or cached file.
    pub path: Option<PathBuf>,
    /// Fallback handle, resolved on demand when `path` cannot be opened.
    #[serde( default )]
    pub remote: Option<String>,
    #[serde( default )]
    pub format: AudioFormat,
    #[serde( default = "default_sample_rate" )]
    pub sample_rate: u32,
    #[serde( default = "default_channels" )]
    pub channels: u16,
}


fn default_sample_rate() -> u32 {
    44100
}


fn default_channels() -> u16 {
    2
}


impl TrackInfo {
    /// Creates a track backed by a local file.
    ///
    /// The path doubles as the identifier and the file stem as the title.
    pub fn from_path( path: impl Into<PathBuf> ) -> Self {
        let path = path.into();
        let title = path.file_stem()
            .map( |s| s.to_string_lossy().into_owned() )
            .unwrap_or_default();

        Self {
            id: path.to_string_lossy().into_owned(),
            title,
            artist: String::new(),
            album: String::new(),
            duration: Duration::ZERO,
            format: AudioFormat::from_path( &path ),
            path: Some( path ),
            remote: None,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }


    /// Creates a track that only exists behind a remote handle.
    pub fn remote( id: impl Into<String>, handle: impl Into<String> ) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            duration: Duration::ZERO,
            path: None,
            remote: Some( handle.into() ),
            format: AudioFormat::Unknown,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }


    /// Locators in the order they should be tried: local first, then remote.
    pub fn locators( &self ) -> impl Iterator<Item = Locator> + '_ {
        self.path.iter()
            .map( |p| Locator::Local( p.clone() ) )
            .chain( self.remote.iter().map( |r| Locator::Remote( r.clone() ) ) )
    }


    /// Human-readable label, "Artist - Title" when the artist is known.
    pub fn label( &self ) -> String {
        let title = if self.title.is_empty() { &self.id } else { &self.title };
        if self.artist.is_empty() {
            title.clone()
        } else {
            format!( "{} - {}", self.artist, title )
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_format_from_extension() {
        assert_eq!( AudioFormat::from_path( Path::new( "a/b.FLAC" ) ), AudioFormat::Flac );
        assert_eq!( AudioFormat::from_path( Path::new( "x.oga" ) ), AudioFormat::Ogg );
        assert_eq!( AudioFormat::from_path( Path::new( "x.aac" ) ), AudioFormat::M4a );
        assert_eq!( AudioFormat::from_path( Path::new( "noext" ) ), AudioFormat::Unknown );
        assert_eq!( AudioFormat::Wav.to_string(), "WAV" );
    }


    #[test]
    fn test_locators_local_then_remote() {
        let mut track = TrackInfo::from_path( "/music/song.mp3" );
        track.remote = Some( "yt:abc".into() );

        let locators: Vec<_> = track.locators().collect();
        assert_eq!( locators, vec![
            Locator::Local( PathBuf::from( "/music/song.mp3" ) ),
            Locator::Remote( "yt:abc".into() ),
        ]);
        assert_eq!( track.title, "song" );
    }


    #[test]
    fn test_label() {
        let mut track = TrackInfo::remote( "id-1", "handle" );
        assert_eq!( track.label(), "id-1" );
        track.title = "Song".into();
        track.artist = "Band".into();
        assert_eq!( track.label(), "Band - Song" );
    }
}
