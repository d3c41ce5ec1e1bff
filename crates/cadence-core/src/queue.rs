//! Playback queue
//!
//! Handles track ordering, the play cursor, shuffle and back-navigation
//! history. Repeat is not applied here: `next()` stops at the end and the
//! engine decides whether to loop, repeat or stop.

use std::fmt;
use std::fs;
use std::path::{ Path, PathBuf };
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{ Deserialize, Serialize };
use thiserror::Error;

use crate::track::TrackInfo;


/// Errors that can occur when persisting the queue.
#[derive( Debug, Error )]
pub enum QueueError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Invalid queue file: {0}" )]
    Format( #[from] serde_json::Error ),
}


/// What happens when the current track finishes.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize )]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}


impl RepeatMode {
    /// Cycles Off → All → One → Off.
    pub fn cycle( self ) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::Off,
        }
    }
}


impl fmt::Display for RepeatMode {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.write_str( match self {
            RepeatMode::Off => "off",
            RepeatMode::One => "one",
            RepeatMode::All => "all",
        })
    }
}


impl FromStr for RepeatMode {
    type Err = String;


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Ok( RepeatMode::Off ),
            "one" | "1" => Ok( RepeatMode::One ),
            "all" | "2" => Ok( RepeatMode::All ),
            _ => Err( format!( "Invalid repeat mode: '{}'. Use 'off', 'one', or 'all'", s ) ),
        }
    }
}


/// Durable form of the queue.
///
/// The shuffle permutation is not stored, only the flag; a fresh one is
/// generated on load.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct QueueSnapshot {
    pub tracks: Vec<TrackInfo>,
    /// Cursor position (in shuffled order when `shuffled` is set)
    pub current_index: usize,
    /// Insertion-order index of the current track
    #[serde( default )]
    pub current_track: Option<usize>,
    pub shuffled: bool,
}


/// Ordered track list with a cursor.
///
/// Indices passed to `remove`/`move_track` and returned by `tracks()` are in
/// insertion order. The cursor (`current_index`, `jump_to`) lives in play
/// order, which equals insertion order unless shuffled.
#[derive( Debug, Clone )]
pub struct Queue {
    tracks: Vec<TrackInfo>,
    /// Play order → insertion index, present while shuffled
    order: Option<Vec<usize>>,
    cursor: usize,
    /// Insertion indices of previously current tracks, most recent last
    history: Vec<usize>,
    rng: StdRng,
}


impl Default for Queue {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            order: None,
            cursor: 0,
            history: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }
}


impl Queue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }


    /// Creates an empty queue whose shuffles are reproducible.
    pub fn with_seed( seed: u64 ) -> Self {
        Self {
            rng: StdRng::seed_from_u64( seed ),
            ..Self::default()
        }
    }


    /// Adds a track to the end of the queue.
    pub fn add( &mut self, track: TrackInfo ) {
        self.tracks.push( track );
        if let Some( order ) = self.order.as_mut() {
            order.push( self.tracks.len() - 1 );
        }
    }


    /// Adds multiple tracks to the end of the queue.
    pub fn add_all( &mut self, tracks: impl IntoIterator<Item = TrackInfo> ) {
        for track in tracks {
            self.add( track );
        }
    }


    /// Inserts a track so that it plays right after the current one.
    pub fn add_next( &mut self, track: TrackInfo ) {
        let Some( current ) = self.current_real() else {
            self.add( track );
            return;
        };

        let at = current + 1;
        self.tracks.insert( at, track );

        for h in self.history.iter_mut() {
            if *h >= at {
                *h += 1;
            }
        }

        if let Some( order ) = self.order.as_mut() {
            for i in order.iter_mut() {
                if *i >= at {
                    *i += 1;
                }
            }
            order.insert( self.cursor + 1, at );
        }
    }


    /// Removes the track at an insertion-order index.
    pub fn remove( &mut self, index: usize ) -> Option<TrackInfo> {
        if index >= self.tracks.len() {
            return None;
        }

        let current = self.current_real().unwrap_or( 0 );
        let removed = self.tracks.remove( index );

        self.history.retain( |&h| h != index );
        for h in self.history.iter_mut() {
            if *h > index {
                *h -= 1;
            }
        }

        if self.tracks.is_empty() {
            self.cursor = 0;
            if let Some( order ) = self.order.as_mut() {
                order.clear();
            }
            return Some( removed );
        }

        // Removing the current track lets the following one slide into its place
        let last = self.tracks.len() - 1;
        let new_current = if index < current { current - 1 } else { current.min( last ) };

        if self.order.is_some() {
            self.cursor = self.cursor.min( last );
            self.regenerate( Some( new_current ) );
        } else {
            self.cursor = new_current;
        }

        Some( removed )
    }


    /// Removes the first track with the given id.
    pub fn remove_id( &mut self, id: &str ) -> Option<TrackInfo> {
        let index = self.tracks.iter().position( |t| t.id == id )?;
        self.remove( index )
    }


    /// Clears the queue.
    pub fn clear( &mut self ) {
        self.tracks.clear();
        self.history.clear();
        self.cursor = 0;
        if let Some( order ) = self.order.as_mut() {
            order.clear();
        }
    }


    /// Moves a track from one insertion-order position to another.
    ///
    /// The cursor keeps pointing at the same track. Returns false when either
    /// index is out of range.
    pub fn move_track( &mut self, from: usize, to: usize ) -> bool {
        if from >= self.tracks.len() || to >= self.tracks.len() {
            return false;
        }

        if from == to {
            return true;
        }

        let current = self.current_real().unwrap_or( 0 );
        let track = self.tracks.remove( from );
        self.tracks.insert( to, track );

        let remap = |i: usize| {
            if i == from {
                to
            } else if from < i && i <= to {
                i - 1
            } else if to <= i && i < from {
                i + 1
            } else {
                i
            }
        };

        for h in self.history.iter_mut() {
            *h = remap( *h );
        }

        let new_current = remap( current );
        if self.order.is_some() {
            self.regenerate( Some( new_current ) );
        } else {
            self.cursor = new_current;
        }

        true
    }


    /// Gets the current track.
    pub fn current( &self ) -> Option<&TrackInfo> {
        self.current_real().and_then( |i| self.tracks.get( i ) )
    }


    /// The track `next()` would move to.
    pub fn peek_next( &self ) -> Option<&TrackInfo> {
        let pos = self.cursor + 1;
        if pos >= self.tracks.len() {
            return None;
        }
        self.tracks.get( self.real( pos ) )
    }


    /// The track `previous()` would move to.
    pub fn peek_previous( &self ) -> Option<&TrackInfo> {
        if let Some( &index ) = self.history.iter().rev().find( |&&h| h < self.tracks.len() ) {
            return self.tracks.get( index );
        }
        if self.cursor > 0 && !self.tracks.is_empty() {
            return self.tracks.get( self.real( self.cursor - 1 ) );
        }
        None
    }


    /// Advances to the next track.
    ///
    /// Returns None at the end of the queue, leaving cursor and history alone.
    pub fn next( &mut self ) -> Option<&TrackInfo> {
        if self.cursor + 1 >= self.tracks.len() {
            return None;
        }

        self.history.push( self.real( self.cursor ) );
        self.cursor += 1;
        self.current()
    }


    /// Goes back to the previously current track.
    ///
    /// History wins over position, so this undoes jumps and survives reshuffles.
    pub fn previous( &mut self ) -> Option<&TrackInfo> {
        if self.tracks.is_empty() {
            return None;
        }

        while let Some( index ) = self.history.pop() {
            if index < self.tracks.len() {
                self.cursor = self.position_of( index );
                return self.current();
            }
        }

        if self.cursor > 0 {
            self.cursor -= 1;
            return self.current();
        }

        None
    }


    /// Jumps to a play-order position.
    pub fn jump_to( &mut self, index: usize ) -> Option<&TrackInfo> {
        if index >= self.tracks.len() {
            return None;
        }

        self.history.push( self.real( self.cursor ) );
        self.cursor = index;
        self.current()
    }


    /// Jumps to the first track with the given id.
    pub fn jump_to_id( &mut self, id: &str ) -> Option<&TrackInfo> {
        let index = self.tracks.iter().position( |t| t.id == id )?;
        let pos = self.position_of( index );
        self.jump_to( pos )
    }


    /// Shuffles play order, keeping the current track at the cursor.
    ///
    /// Calling it again while shuffled draws a new permutation.
    pub fn shuffle( &mut self ) {
        let current = self.current_real();
        self.regenerate( current );
        tracing::debug!( "Shuffled {} tracks", self.tracks.len() );
    }


    /// Returns to insertion order, keeping the current track.
    pub fn unshuffle( &mut self ) {
        if let Some( order ) = self.order.take() {
            self.cursor = order.get( self.cursor ).copied().unwrap_or( 0 );
        }
    }


    /// Returns true while a shuffle permutation is active.
    pub fn is_shuffled( &self ) -> bool {
        self.order.is_some()
    }


    /// The active permutation (play position → insertion index).
    pub fn shuffle_order( &self ) -> Option<&[usize]> {
        self.order.as_deref()
    }


    /// Gets all tracks in insertion order.
    pub fn tracks( &self ) -> &[TrackInfo] {
        &self.tracks
    }


    /// Gets the number of tracks.
    pub fn len( &self ) -> usize {
        self.tracks.len()
    }


    /// Returns true if the queue is empty.
    pub fn is_empty( &self ) -> bool {
        self.tracks.is_empty()
    }


    /// Cursor position in play order.
    pub fn current_index( &self ) -> usize {
        self.cursor
    }


    /// Insertion-order index of the current track.
    pub fn current_track_index( &self ) -> Option<usize> {
        self.current_real()
    }


    /// Play-order position of the track at an insertion-order index.
    pub fn play_position( &self, index: usize ) -> Option<usize> {
        if index >= self.tracks.len() {
            return None;
        }
        Some( self.position_of( index ) )
    }


    /// Insertion indices of previously current tracks, most recent last.
    pub fn history( &self ) -> &[usize] {
        &self.history
    }


    /// Captures the durable state.
    pub fn snapshot( &self ) -> QueueSnapshot {
        QueueSnapshot {
            tracks: self.tracks.clone(),
            current_index: self.cursor,
            current_track: self.current_real(),
            shuffled: self.is_shuffled(),
        }
    }


    /// Rebuilds a queue from its durable state.
    pub fn from_snapshot( snapshot: QueueSnapshot ) -> Self {
        let mut queue = Self::new();
        queue.restore( snapshot );
        queue
    }


    /// Replaces the contents with a snapshot, keeping this queue's generator.
    pub fn restore( &mut self, snapshot: QueueSnapshot ) {
        let last = snapshot.tracks.len().saturating_sub( 1 );

        self.tracks = snapshot.tracks;
        self.history.clear();
        self.order = None;
        self.cursor = snapshot.current_index.min( last );

        if snapshot.shuffled {
            let pin = snapshot.current_track.unwrap_or( self.cursor ).min( last );
            self.regenerate( if self.tracks.is_empty() { None } else { Some( pin ) } );
        }
    }


    /// Saves the queue as JSON.
    pub fn save( &self, path: &Path ) -> Result<(), QueueError> {
        if let Some( parent ) = path.parent() {
            fs::create_dir_all( parent )?;
        }
        let json = serde_json::to_string_pretty( &self.snapshot() )?;
        fs::write( path, json )?;
        Ok(())
    }


    /// Loads a queue saved by `save`.
    pub fn load( path: &Path ) -> Result<Self, QueueError> {
        Ok( Self::from_snapshot( Self::read_snapshot( path )? ) )
    }


    /// Reads a snapshot written by `save` without building a queue.
    pub fn read_snapshot( path: &Path ) -> Result<QueueSnapshot, QueueError> {
        let contents = fs::read_to_string( path )?;
        let snapshot: QueueSnapshot = serde_json::from_str( &contents )?;
        tracing::info!( "Loaded queue of {} tracks from {:?}", snapshot.tracks.len(), path );
        Ok( snapshot )
    }


    /// Default location of the persisted queue.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map( |d| d.join( "cadence" ).join( "queue.json" ) )
    }


    fn real( &self, pos: usize ) -> usize {
        match &self.order {
            Some( order ) => order[ pos ],
            None => pos,
        }
    }


    fn current_real( &self ) -> Option<usize> {
        if self.tracks.is_empty() {
            None
        } else {
            Some( self.real( self.cursor ) )
        }
    }


    fn position_of( &self, index: usize ) -> usize {
        match &self.order {
            Some( order ) => order.iter().position( |&i| i == index ).unwrap_or( 0 ),
            None => index,
        }
    }


    /// Draws a full permutation, then swaps `pin` into the cursor slot.
    fn regenerate( &mut self, pin: Option<usize> ) {
        let mut order: Vec<usize> = ( 0..self.tracks.len() ).collect();
        order.shuffle( &mut self.rng );

        if let Some( pin ) = pin {
            if let Some( at ) = order.iter().position( |&i| i == pin ) {
                order.swap( at, self.cursor );
            }
        }

        self.order = Some( order );
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use rand::Rng;


    fn track( id: &str ) -> TrackInfo {
        let mut track = TrackInfo::remote( id, format!( "handle-{}", id ) );
        track.title = format!( "Track {}", id );
        track
    }


    fn queue_of( ids: &[&str] ) -> Queue {
        let mut queue = Queue::with_seed( 7 );
        queue.add_all( ids.iter().map( |id| track( id ) ) );
        queue
    }


    fn current_id( queue: &Queue ) -> Option<String> {
        queue.current().map( |t| t.id.clone() )
    }


    fn assert_invariants( queue: &Queue ) {
        if !queue.is_empty() {
            assert!( queue.current_index() < queue.len() );
            assert!( queue.current().is_some() );
        }
        if let Some( order ) = queue.shuffle_order() {
            assert_eq!( order.len(), queue.len() );
            let unique: HashSet<_> = order.iter().copied().collect();
            assert_eq!( unique.len(), queue.len() );
            assert!( order.iter().all( |&i| i < queue.len() ) );
        }
        assert!( queue.history().iter().all( |&h| h < queue.len() ) );
    }


    #[test]
    fn test_empty_queue() {
        let mut queue = Queue::new();
        assert!( queue.is_empty() );
        assert_eq!( queue.len(), 0 );
        assert!( queue.current().is_none() );
        assert!( queue.next().is_none() );
        assert!( queue.previous().is_none() );
        assert!( queue.peek_next().is_none() );
        assert!( queue.peek_previous().is_none() );
    }


    #[test]
    fn test_navigation_stops_at_end() {
        let mut queue = Queue::new();
        for ( id, ms ) in [ ( "A", 180_000 ), ( "B", 120_000 ), ( "C", 240_000 ) ] {
            let mut t = track( id );
            t.duration = Duration::from_millis( ms );
            queue.add( t );
        }

        assert_eq!( queue.current_index(), 0 );
        assert_eq!( queue.next().map( |t| t.id.as_str() ), Some( "B" ) );
        assert_eq!( queue.next().map( |t| t.id.as_str() ), Some( "C" ) );
        assert!( queue.next().is_none() );

        // A failed advance leaves everything in place
        assert_eq!( current_id( &queue ).as_deref(), Some( "C" ) );
        assert_eq!( queue.history(), &[ 0, 1 ] );
    }


    #[test]
    fn test_n_minus_one_nexts_reach_last() {
        let ids: Vec<String> = ( 0..6 ).map( |i| i.to_string() ).collect();
        let refs: Vec<&str> = ids.iter().map( |s| s.as_str() ).collect();
        let mut queue = queue_of( &refs );

        for _ in 0..5 {
            assert!( queue.next().is_some() );
        }
        assert_eq!( current_id( &queue ).as_deref(), Some( "5" ) );
        assert!( queue.next().is_none() );
    }


    #[test]
    fn test_previous_after_next_unshuffled() {
        let mut queue = queue_of( &[ "a", "b", "c" ] );
        queue.next();
        assert_eq!( queue.previous().map( |t| t.id.as_str() ), Some( "a" ) );
        assert!( queue.previous().is_none() );
    }


    #[test]
    fn test_previous_after_next_shuffled() {
        for seed in 0..20 {
            let mut queue = Queue::with_seed( seed );
            queue.add_all( [ "a", "b", "c", "d", "e" ].iter().map( |id| track( id ) ) );
            queue.jump_to( 2 );
            queue.shuffle();

            let before = current_id( &queue );
            queue.next();
            assert_eq!( queue.previous().map( |t| t.id.clone() ), before );
        }
    }


    #[test]
    fn test_previous_survives_reshuffle() {
        let mut queue = queue_of( &[ "a", "b", "c", "d" ] );
        queue.shuffle();
        let first = current_id( &queue );
        queue.next();
        queue.shuffle();
        assert_eq!( queue.previous().map( |t| t.id.clone() ), first );
    }


    #[test]
    fn test_previous_without_history_steps_back() {
        let mut queue = queue_of( &[ "a", "b", "c" ] );
        queue.jump_to( 2 );
        queue.previous();
        assert_eq!( current_id( &queue ).as_deref(), Some( "a" ) );

        // History exhausted, plain positional step
        let mut queue = Queue::from_snapshot( QueueSnapshot {
            tracks: vec![ track( "a" ), track( "b" ), track( "c" ) ],
            current_index: 2,
            current_track: Some( 2 ),
            shuffled: false,
        });
        assert_eq!( queue.peek_previous().map( |t| t.id.as_str() ), Some( "b" ) );
        assert_eq!( queue.previous().map( |t| t.id.as_str() ), Some( "b" ) );
    }


    #[test]
    fn test_peek_previous_matches_previous() {
        let mut queue = queue_of( &[ "a", "b", "c", "d" ] );
        queue.jump_to( 3 );
        queue.jump_to( 1 );

        let peeked = queue.peek_previous().map( |t| t.id.clone() );
        assert_eq!( peeked.as_deref(), Some( "d" ) );
        assert_eq!( queue.previous().map( |t| t.id.clone() ), peeked );
    }


    #[test]
    fn test_jump_to_and_id() {
        let mut queue = queue_of( &[ "1", "2", "3" ] );
        assert_eq!( queue.jump_to( 2 ).map( |t| t.id.as_str() ), Some( "3" ) );
        assert_eq!( queue.current_index(), 2 );
        assert!( queue.jump_to( 3 ).is_none() );

        queue.shuffle();
        let pos = queue.play_position( 1 ).unwrap();
        assert_eq!( queue.jump_to( pos ).map( |t| t.id.as_str() ), Some( "2" ) );
        assert!( queue.play_position( 3 ).is_none() );
        assert_eq!( queue.jump_to_id( "1" ).map( |t| t.id.as_str() ), Some( "1" ) );
        assert_eq!( current_id( &queue ).as_deref(), Some( "1" ) );
        assert!( queue.jump_to_id( "missing" ).is_none() );
    }


    #[test]
    fn test_remove_before_current_keeps_track() {
        let mut queue = queue_of( &[ "1", "2", "3" ] );
        queue.jump_to( 2 );
        queue.remove( 0 );
        assert_eq!( queue.current_index(), 1 );
        assert_eq!( current_id( &queue ).as_deref(), Some( "3" ) );
    }


    #[test]
    fn test_remove_current_last_clamps() {
        let mut queue = queue_of( &[ "1", "2", "3" ] );
        queue.jump_to( 2 );
        queue.remove( 2 );
        assert_eq!( queue.current_index(), 1 );
        assert_eq!( current_id( &queue ).as_deref(), Some( "2" ) );

        queue.remove( 0 );
        queue.remove( 0 );
        assert!( queue.is_empty() );
        assert_eq!( queue.current_index(), 0 );
    }


    #[test]
    fn test_remove_by_id() {
        let mut queue = queue_of( &[ "1", "2", "3" ] );
        assert_eq!( queue.remove_id( "2" ).map( |t| t.id ), Some( "2".to_string() ) );
        let ids: Vec<_> = queue.tracks().iter().map( |t| t.id.as_str() ).collect();
        assert_eq!( ids, vec![ "1", "3" ] );
        assert!( queue.remove_id( "2" ).is_none() );
    }


    #[test]
    fn test_remove_while_shuffled_pins_current() {
        let mut queue = queue_of( &[ "a", "b", "c", "d", "e" ] );
        queue.jump_to( 3 );
        queue.shuffle();
        let current = current_id( &queue );
        let victim = queue.tracks().iter().position( |t| Some( &t.id ) != current.as_ref() ).unwrap();
        queue.remove( victim );
        assert_eq!( current_id( &queue ), current );
        assert_invariants( &queue );
    }


    #[test]
    fn test_move_keeps_current() {
        let mut queue = queue_of( &[ "1", "2", "3" ] );
        queue.move_track( 0, 2 );
        let ids: Vec<_> = queue.tracks().iter().map( |t| t.id.as_str() ).collect();
        assert_eq!( ids, vec![ "2", "3", "1" ] );
        assert_eq!( current_id( &queue ).as_deref(), Some( "1" ) );
        assert_eq!( queue.current_index(), 2 );

        queue.jump_to( 0 );
        queue.move_track( 2, 0 );
        assert_eq!( current_id( &queue ).as_deref(), Some( "2" ) );
        assert_eq!( queue.current_index(), 1 );

        assert!( !queue.move_track( 0, 3 ) );
    }


    #[test]
    fn test_add_next_plays_next() {
        let mut queue = queue_of( &[ "1", "2", "3" ] );
        queue.add_next( track( "x" ) );
        assert_eq!( queue.peek_next().map( |t| t.id.as_str() ), Some( "x" ) );
        assert_eq!( queue.tracks()[ 1 ].id, "x" );

        queue.shuffle();
        queue.add_next( track( "y" ) );
        assert_eq!( queue.peek_next().map( |t| t.id.as_str() ), Some( "y" ) );
        assert_invariants( &queue );
    }


    #[test]
    fn test_add_next_on_empty_queue() {
        let mut queue = Queue::new();
        queue.add_next( track( "only" ) );
        assert_eq!( current_id( &queue ).as_deref(), Some( "only" ) );
    }


    #[test]
    fn test_add_while_shuffled_extends_permutation() {
        let mut queue = queue_of( &[ "1", "2" ] );
        queue.shuffle();
        queue.add( track( "3" ) );
        queue.add_all( vec![ track( "4" ), track( "5" ) ] );
        assert_invariants( &queue );
    }


    #[test]
    fn test_shuffle_pins_current_on_small_queues() {
        for size in 1..=3usize {
            for cursor in 0..size {
                for seed in 0..25 {
                    let mut queue = Queue::with_seed( seed );
                    queue.add_all( ( 0..size ).map( |i| track( &i.to_string() ) ) );
                    if cursor > 0 {
                        queue.jump_to( cursor );
                    }
                    let before = current_id( &queue );

                    queue.shuffle();
                    assert_eq!( queue.current_index(), cursor );
                    assert_eq!( current_id( &queue ), before, "size {} cursor {} seed {}", size, cursor, seed );
                    assert_invariants( &queue );

                    // Reshuffling an already shuffled queue keeps the pin too
                    queue.shuffle();
                    assert_eq!( current_id( &queue ), before );
                }
            }
        }
    }


    #[test]
    fn test_shuffle_then_unshuffle_preserves_tracks_and_current() {
        let mut queue = queue_of( &[ "a", "b", "c", "d", "e", "f" ] );
        queue.jump_to( 4 );
        let before: Vec<_> = queue.tracks().iter().map( |t| t.id.clone() ).collect();

        queue.shuffle();
        assert!( queue.is_shuffled() );
        queue.unshuffle();
        assert!( !queue.is_shuffled() );

        let after: Vec<_> = queue.tracks().iter().map( |t| t.id.clone() ).collect();
        assert_eq!( before, after );
        assert_eq!( queue.current_index(), 4 );
        assert_eq!( current_id( &queue ).as_deref(), Some( "e" ) );
    }


    #[test]
    fn test_shuffled_walk_visits_every_track_once() {
        let mut queue = queue_of( &[ "a", "b", "c", "d", "e" ] );
        queue.shuffle();

        let mut seen = HashSet::new();
        seen.insert( current_id( &queue ).unwrap() );
        while let Some( t ) = queue.next() {
            assert!( seen.insert( t.id.clone() ) );
        }
        assert_eq!( seen.len(), 5 );
    }


    #[test]
    fn test_random_edits_keep_invariants() {
        let mut rng = StdRng::seed_from_u64( 42 );
        let mut queue = Queue::with_seed( 1 );
        let mut next_id = 0;

        for _ in 0..2000 {
            let len = queue.len();
            match rng.gen_range( 0..10 ) {
                0 | 1 => {
                    queue.add( track( &next_id.to_string() ) );
                    next_id += 1;
                }
                2 => {
                    queue.add_next( track( &next_id.to_string() ) );
                    next_id += 1;
                }
                3 if len > 0 => {
                    queue.remove( rng.gen_range( 0..len ) );
                }
                4 if len > 0 => {
                    queue.move_track( rng.gen_range( 0..len ), rng.gen_range( 0..len ) );
                }
                5 => {
                    queue.next();
                }
                6 => {
                    queue.previous();
                }
                7 if len > 0 => {
                    queue.jump_to( rng.gen_range( 0..len ) );
                }
                8 => queue.shuffle(),
                9 => queue.unshuffle(),
                _ => {}
            }
            assert_invariants( &queue );
        }
    }


    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "nested" ).join( "queue.json" );

        let mut queue = queue_of( &[ "a", "b", "c" ] );
        queue.jump_to( 1 );
        queue.save( &path ).unwrap();

        let loaded = Queue::load( &path ).unwrap();
        assert_eq!( loaded.tracks(), queue.tracks() );
        assert_eq!( loaded.current_index(), 1 );
        assert!( !loaded.is_shuffled() );
        assert!( loaded.history().is_empty() );
    }


    #[test]
    fn test_load_shuffled_regenerates_with_current_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "queue.json" );

        let mut queue = queue_of( &[ "a", "b", "c", "d" ] );
        queue.shuffle();
        queue.next();
        let current = current_id( &queue );
        let cursor = queue.current_index();
        queue.save( &path ).unwrap();

        let loaded = Queue::load( &path ).unwrap();
        assert!( loaded.is_shuffled() );
        assert_eq!( loaded.current_index(), cursor );
        assert_eq!( current_id( &loaded ), current );
        assert_invariants( &loaded );
    }


    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "queue.json" );
        fs::write( &path, "{ not json" ).unwrap();
        assert!( matches!( Queue::load( &path ), Err( QueueError::Format( _ ) ) ) );
        assert!( matches!( Queue::load( &dir.path().join( "nope" ) ), Err( QueueError::Io( _ ) ) ) );
    }


    #[test]
    fn test_repeat_mode_parse_and_cycle() {
        assert_eq!( "ALL".parse::<RepeatMode>(), Ok( RepeatMode::All ) );
        assert_eq!( "1".parse::<RepeatMode>(), Ok( RepeatMode::One ) );
        assert!( "sometimes".parse::<RepeatMode>().is_err() );
        assert_eq!( RepeatMode::Off.cycle(), RepeatMode::All );
        assert_eq!( RepeatMode::One.cycle(), RepeatMode::Off );
    }
}
