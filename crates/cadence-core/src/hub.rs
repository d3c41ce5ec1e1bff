//! Notification hub
//!
//! Publish/subscribe for playback events. `emit` delivers on the calling
//! thread; `post` enqueues onto a bounded channel without blocking, for
//! producers that must never wait (the audio callback). The queue belongs to
//! the engine that owns the hub: it runs track-end transitions for queued
//! `TrackEnded` events and emits everything else to subscribers.

use std::panic::{ self, AssertUnwindSafe };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::{ Arc, Mutex };
use std::time::Duration;

use crossbeam_channel::{ bounded, Receiver, Sender, TrySendError };

use crate::track::TrackInfo;


/// Capacity of the deferred queue.
pub const DEFERRED_CAPACITY: usize = 64;


/// Something that happened in the engine.
#[derive( Debug, Clone, PartialEq )]
pub enum Event {
    PlaybackStarted { track: TrackInfo },
    PlaybackPaused,
    PlaybackStopped,
    PlaybackProgress { position: Duration, duration: Duration },
    TrackChanged { track: TrackInfo },
    VolumeChanged { volume: f32 },
    QueueChanged,
    /// The loaded track ran out. `generation` identifies which load it belongs to.
    TrackEnded { generation: u64 },
    Error { message: String },
}


/// Discriminant of `Event`, used to filter subscriptions.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum EventKind {
    PlaybackStarted,
    PlaybackPaused,
    PlaybackStopped,
    PlaybackProgress,
    TrackChanged,
    VolumeChanged,
    QueueChanged,
    TrackEnded,
    Error,
}


impl Event {
    pub fn kind( &self ) -> EventKind {
        match self {
            Event::PlaybackStarted { .. } => EventKind::PlaybackStarted,
            Event::PlaybackPaused => EventKind::PlaybackPaused,
            Event::PlaybackStopped => EventKind::PlaybackStopped,
            Event::PlaybackProgress { .. } => EventKind::PlaybackProgress,
            Event::TrackChanged { .. } => EventKind::TrackChanged,
            Event::VolumeChanged { .. } => EventKind::VolumeChanged,
            Event::QueueChanged => EventKind::QueueChanged,
            Event::TrackEnded { .. } => EventKind::TrackEnded,
            Event::Error { .. } => EventKind::Error,
        }
    }
}


/// Handle returned by `subscribe`, used to unsubscribe.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub struct SubscriptionId( u64 );


type Callback = Arc<dyn Fn( &Event ) + Send + Sync>;


struct Subscription {
    id: SubscriptionId,
    /// None subscribes to every kind
    kind: Option<EventKind>,
    callback: Callback,
}


/// Event fan-out shared by the engine and its hosts.
pub struct NotificationHub {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    deferred_tx: Sender<Event>,
    deferred_rx: Receiver<Event>,
}


impl NotificationHub {
    pub fn new() -> Self {
        Self::with_capacity( DEFERRED_CAPACITY )
    }


    /// Creates a hub whose deferred queue holds at most `capacity` events.
    pub fn with_capacity( capacity: usize ) -> Self {
        let ( deferred_tx, deferred_rx ) = bounded( capacity.max( 1 ) );
        Self {
            subscriptions: Mutex::new( Vec::new() ),
            next_id: AtomicU64::new( 1 ),
            deferred_tx,
            deferred_rx,
        }
    }


    /// Subscribes to one kind of event.
    pub fn subscribe<F>( &self, kind: EventKind, callback: F ) -> SubscriptionId
    where
        F: Fn( &Event ) + Send + Sync + 'static,
    {
        self.add_subscription( Some( kind ), Arc::new( callback ) )
    }


    /// Subscribes to every event.
    pub fn subscribe_all<F>( &self, callback: F ) -> SubscriptionId
    where
        F: Fn( &Event ) + Send + Sync + 'static,
    {
        self.add_subscription( None, Arc::new( callback ) )
    }


    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe( &self, id: SubscriptionId ) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let before = subscriptions.len();
        subscriptions.retain( |s| s.id != id );
        subscriptions.len() != before
    }


    pub fn subscriber_count( &self ) -> usize {
        self.subscriptions.lock().unwrap().len()
    }


    /// Delivers an event to matching subscribers on the calling thread.
    ///
    /// Callbacks run outside the subscription lock, so they may subscribe or
    /// unsubscribe. A panicking callback is logged and skipped.
    pub fn emit( &self, event: Event ) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.iter()
                .filter( |s| s.kind.map_or( true, |k| k == kind ) )
                .map( |s| Arc::clone( &s.callback ) )
                .collect()
        };

        for callback in callbacks {
            if panic::catch_unwind( AssertUnwindSafe( || callback( &event ) ) ).is_err() {
                tracing::error!( "Subscriber panicked while handling {:?}", kind );
            }
        }
    }


    /// Enqueues an event for later delivery. Never blocks.
    ///
    /// Returns false when the queue is full and the event was dropped.
    pub fn post( &self, event: Event ) -> bool {
        match self.deferred_tx.try_send( event ) {
            Ok(()) => true,
            Err( TrySendError::Full( _ ) ) | Err( TrySendError::Disconnected( _ ) ) => false,
        }
    }


    /// Receiving end of the deferred queue, drained only by the engine.
    pub(crate) fn deferred( &self ) -> &Receiver<Event> {
        &self.deferred_rx
    }


    /// Number of events waiting in the deferred queue.
    pub fn pending( &self ) -> usize {
        self.deferred_rx.len()
    }


    pub fn emit_playback_progress( &self, position: Duration, duration: Duration ) {
        self.emit( Event::PlaybackProgress { position, duration } );
    }


    pub fn emit_volume_changed( &self, volume: f32 ) {
        self.emit( Event::VolumeChanged { volume } );
    }


    pub fn emit_queue_changed( &self ) {
        self.emit( Event::QueueChanged );
    }


    fn add_subscription( &self, kind: Option<EventKind>, callback: Callback ) -> SubscriptionId {
        let id = SubscriptionId( self.next_id.fetch_add( 1, Ordering::Relaxed ) );
        self.subscriptions.lock().unwrap().push( Subscription { id, kind, callback } );
        id
    }
}


impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;


    fn recorder( hub: &NotificationHub ) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new( Mutex::new( Vec::new() ) );
        let sink = Arc::clone( &seen );
        hub.subscribe_all( move |e| sink.lock().unwrap().push( e.clone() ) );
        seen
    }


    #[test]
    fn test_subscribe_filters_by_kind() {
        let hub = NotificationHub::new();
        let count = Arc::new( AtomicUsize::new( 0 ) );
        let c = Arc::clone( &count );
        hub.subscribe( EventKind::VolumeChanged, move |_| {
            c.fetch_add( 1, Ordering::SeqCst );
        });

        hub.emit_volume_changed( 0.5 );
        hub.emit( Event::PlaybackPaused );
        hub.emit_volume_changed( 0.2 );

        assert_eq!( count.load( Ordering::SeqCst ), 2 );
    }


    #[test]
    fn test_subscribe_all_sees_everything_in_order() {
        let hub = NotificationHub::new();
        let seen = recorder( &hub );
        let track = TrackInfo::remote( "t", "h" );

        hub.emit( Event::TrackChanged { track: track.clone() } );
        hub.emit( Event::PlaybackStarted { track } );
        hub.emit( Event::PlaybackStopped );

        let kinds: Vec<_> = seen.lock().unwrap().iter().map( |e| e.kind() ).collect();
        assert_eq!( kinds, vec![ EventKind::TrackChanged, EventKind::PlaybackStarted, EventKind::PlaybackStopped ] );
    }


    #[test]
    fn test_unsubscribe() {
        let hub = NotificationHub::new();
        let count = Arc::new( AtomicUsize::new( 0 ) );
        let c = Arc::clone( &count );
        let id = hub.subscribe_all( move |_| {
            c.fetch_add( 1, Ordering::SeqCst );
        });

        hub.emit_queue_changed();
        assert!( hub.unsubscribe( id ) );
        assert!( !hub.unsubscribe( id ) );
        hub.emit_queue_changed();

        assert_eq!( count.load( Ordering::SeqCst ), 1 );
        assert_eq!( hub.subscriber_count(), 0 );
    }


    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let hub = NotificationHub::new();
        hub.subscribe_all( |_| panic!( "bad subscriber" ) );
        let seen = recorder( &hub );

        hub.emit( Event::Error { message: "boom".into() } );

        assert_eq!( *seen.lock().unwrap(), vec![ Event::Error { message: "boom".into() } ] );
    }


    #[test]
    fn test_posted_events_are_queued_not_delivered() {
        let hub = NotificationHub::new();
        let seen = recorder( &hub );

        assert!( hub.post( Event::TrackEnded { generation: 3 } ) );
        assert!( hub.post( Event::QueueChanged ) );
        assert!( seen.lock().unwrap().is_empty() );
        assert_eq!( hub.pending(), 2 );

        assert_eq!( hub.deferred().try_recv().ok(), Some( Event::TrackEnded { generation: 3 } ) );
        assert_eq!( hub.deferred().try_recv().ok(), Some( Event::QueueChanged ) );
        assert!( seen.lock().unwrap().is_empty() );
    }


    #[test]
    fn test_post_never_blocks_when_full() {
        let hub = NotificationHub::with_capacity( 2 );
        assert!( hub.post( Event::QueueChanged ) );
        assert!( hub.post( Event::QueueChanged ) );
        assert!( !hub.post( Event::QueueChanged ) );
        assert_eq!( hub.pending(), 2 );
    }


    #[test]
    fn test_subscriber_may_unsubscribe_itself() {
        let hub = Arc::new( NotificationHub::new() );
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new( Mutex::new( None ) );

        let h = Arc::clone( &hub );
        let s = Arc::clone( &slot );
        let id = hub.subscribe_all( move |_| {
            if let Some( id ) = *s.lock().unwrap() {
                h.unsubscribe( id );
            }
        });
        *slot.lock().unwrap() = Some( id );

        hub.emit_queue_changed();
        assert_eq!( hub.subscriber_count(), 0 );
    }
}
