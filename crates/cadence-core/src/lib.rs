//! Cadence Core - Realtime audio playback engine
//!
//! This crate provides decoding, device output, the playback queue, event
//! notification and the engine that drives them, plus library scanning, M3U playlists
//! and the slash command language used by front ends.

pub mod command;
pub mod decoder;
pub mod engine;
pub mod hub;
pub mod library;
pub mod output;
pub mod playlist;
pub mod queue;
pub mod source;
pub mod track;

pub use command::{ Command, CommandError, PlaylistTarget };
pub use decoder::{ Decoder, DecoderError, DecoderOpener, FrameSource, OutputFormat, SymphoniaOpener };
pub use engine::{ AnalysisCallback, Engine, EngineConfig, EngineError, EngineParts, PlaybackState };
pub use hub::{ Event, EventKind, NotificationHub, SubscriptionId };
pub use library::{ LibraryError, LibraryScanner };
pub use output::{ OutputBackend, OutputError };
pub use playlist::{ Playlist, PlaylistError, PlaylistManager };
pub use queue::{ Queue, QueueError, QueueSnapshot, RepeatMode };
pub use source::{ CacheDirResolver, ResolveError, SourceResolver };
pub use track::{ AudioFormat, Locator, TrackInfo };
