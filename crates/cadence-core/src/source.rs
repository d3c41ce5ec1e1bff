//! Source resolution
//!
//! Turns a track's remote handle into a local path the decoder can open.
//! Fetching content is someone else's job; resolvers only know where it
//! ends up.

use std::path::{ Path, PathBuf };

use thiserror::Error;

use crate::library::SUPPORTED_EXTENSIONS;


/// Errors that can occur while resolving a remote handle.
#[derive( Debug, Error )]
pub enum ResolveError {
    #[error( "Invalid handle: {0:?}" )]
    InvalidHandle( String ),

    #[error( "Not available locally: {0}" )]
    NotCached( String ),
}


/// Maps remote handles to openable paths.
pub trait SourceResolver: Send + Sync {
    fn resolve( &self, handle: &str ) -> Result<PathBuf, ResolveError>;
}


/// Resolves handles to files previously stored in a cache directory.
///
/// A handle `yt:abc123` is looked up as `<dir>/yt_abc123` or
/// `<dir>/yt_abc123.<ext>` for any supported audio extension.
#[derive( Debug, Clone )]
pub struct CacheDirResolver {
    dir: PathBuf,
}


impl CacheDirResolver {
    pub fn new( dir: impl Into<PathBuf> ) -> Self {
        Self { dir: dir.into() }
    }


    /// Default cache location under the user's cache directory.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map( |d| d.join( "cadence" ).join( "sources" ) )
    }


    pub fn dir( &self ) -> &Path {
        &self.dir
    }


    /// File stem a handle is stored under.
    pub fn file_stem( handle: &str ) -> Result<String, ResolveError> {
        let stem: String = handle.trim()
            .chars()
            .map( |c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' } )
            .collect();

        if stem.is_empty() || stem.chars().all( |c| c == '.' ) {
            return Err( ResolveError::InvalidHandle( handle.to_string() ) );
        }
        Ok( stem )
    }
}


impl SourceResolver for CacheDirResolver {
    fn resolve( &self, handle: &str ) -> Result<PathBuf, ResolveError> {
        let stem = Self::file_stem( handle )?;

        let exact = self.dir.join( &stem );
        if exact.is_file() {
            return Ok( exact );
        }

        for ext in SUPPORTED_EXTENSIONS {
            let candidate = self.dir.join( format!( "{}.{}", stem, ext ) );
            if candidate.is_file() {
                tracing::debug!( "Resolved {} to {:?}", handle, candidate );
                return Ok( candidate );
            }
        }

        Err( ResolveError::NotCached( handle.to_string() ) )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;


    #[test]
    fn test_file_stem_sanitizes() {
        assert_eq!( CacheDirResolver::file_stem( "yt:abc/123" ).unwrap(), "yt_abc_123" );
        assert_eq!( CacheDirResolver::file_stem( "ep-1.2" ).unwrap(), "ep-1.2" );
        assert!( matches!( CacheDirResolver::file_stem( "  " ), Err( ResolveError::InvalidHandle( _ ) ) ) );
        assert!( matches!( CacheDirResolver::file_stem( ".." ), Err( ResolveError::InvalidHandle( _ ) ) ) );
    }


    #[test]
    fn test_resolves_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join( "yt_abc.opus" );
        fs::write( &file, b"data" ).unwrap();

        let resolver = CacheDirResolver::new( dir.path() );
        assert_eq!( resolver.resolve( "yt:abc" ).unwrap(), file );
    }


    #[test]
    fn test_resolves_exact_name_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write( dir.path().join( "episode" ), b"x" ).unwrap();
        fs::write( dir.path().join( "episode.mp3" ), b"x" ).unwrap();

        let resolver = CacheDirResolver::new( dir.path() );
        assert_eq!( resolver.resolve( "episode" ).unwrap(), dir.path().join( "episode" ) );
    }


    #[test]
    fn test_missing_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CacheDirResolver::new( dir.path() );
        assert!( matches!( resolver.resolve( "nothing" ), Err( ResolveError::NotCached( _ ) ) ) );
    }
}
