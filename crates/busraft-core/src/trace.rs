//! # trace
//!
//! why: expose the engine's observable events to diagnostics without
//! coupling the core to any particular sink
//! relations: RaftNode emits these alongside its tracing log lines
//! what: TraceEvent codes, Tracer trait, NullTracer

/// Observable engine events, reported with one integer argument each
/// (a node ID, a term, an index, or a vote count depending on the event).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    StateSwitch,
    ActiveSwitch,
    NewLogEntry,
    NewEntryCommitted,
    CommitIndexUpdate,
    VoteRequestInitiated,
    VoteRequestReceived,
    VoteRequestSucceeded,
    AppendEntriesCallFailure,
    AppendEntriesRespUnsuccessful,
    PersistStateUpdateError,
    ElectionComplete,
    NewerTermInResponse,
    RequestIgnored,
    CoreInitialized,
    Error,
}

/// fire-and-forget event sink
pub trait Tracer {
    fn on_event(&mut self, event: TraceEvent, argument: i64);
}

/// discards every event
pub struct NullTracer;

impl Tracer for NullTracer {
    fn on_event(&mut self, _event: TraceEvent, _argument: i64) {}
}
