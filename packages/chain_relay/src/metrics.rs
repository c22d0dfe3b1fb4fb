//! Metrics for the pool, the event bus and the chain relay.
//!
//! All events are plain counters. The metrics use per-thread event instances, matching the
//! single-threaded nature of the types they observe.

use nm::Event;

thread_local! {
    /// Pooled instances constructed because no idle instance of the type was available.
    pub(crate) static POOL_CONSTRUCTED: Event = Event::builder()
        .name("chain_relay_pool_constructed")
        .build();

    /// Allocations satisfied from the idle list of the type.
    pub(crate) static POOL_REUSED: Event = Event::builder()
        .name("chain_relay_pool_reused")
        .build();

    /// Events published through an event bus.
    pub(crate) static EVENTS_PUBLISHED: Event = Event::builder()
        .name("chain_relay_events_published")
        .build();

    /// Chain runs started in response to a published event.
    pub(crate) static CHAINS_STARTED: Event = Event::builder()
        .name("chain_relay_chains_started")
        .build();

    /// Chain runs in which every step completed successfully.
    pub(crate) static CHAINS_COMPLETED: Event = Event::builder()
        .name("chain_relay_chains_completed")
        .build();

    /// Chain runs that ended in failure, whether or not a failure step ran.
    pub(crate) static CHAINS_FAILED: Event = Event::builder()
        .name("chain_relay_chains_failed")
        .build();

    /// Steps that suspended their run to resolve later.
    pub(crate) static STEPS_RETAINED: Event = Event::builder()
        .name("chain_relay_steps_retained")
        .build();

    /// Standalone steps launched outside of any chain.
    pub(crate) static LAUNCHES: Event = Event::builder()
        .name("chain_relay_launches")
        .build();
}
