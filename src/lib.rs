//! # Flowstate: Durable Flow State Machine Runtime
//!
//! Flowstate runs long-lived user workflows ("flows") that talk to
//! counterparty nodes over sessions, persist their progress as checkpoints,
//! and survive process restarts. User code gets the illusion of
//! straight-line blocking calls across hours of wall-clock time; underneath,
//! every blocking point is an explicit I/O request, every suspension is a
//! serialized continuation, and every side effect commits atomically with
//! the checkpoint that justified it.
//!
//! ## Core Concepts
//!
//! - **Flows**: Explicit state machines implementing [`flow::FlowLogic`];
//!   the flow object's own serde state is the continuation that gets
//!   checkpointed
//! - **Transition function**: A pure `(state, event) → (state', actions,
//!   continuation)` in [`transition`] — the single place decisions are made
//! - **Actions**: The side effects a transition requests, applied in order
//!   inside one store transaction by the [`executor`]
//! - **Sessions**: FIFO-ordered bidirectional channels to counterparty
//!   flows, with deduplication ids that make at-least-once delivery safe
//! - **Manager**: [`manager::FlowManager`] starts, resumes, routes, and
//!   kills flows, and reconstructs workers from checkpoints at startup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowstate::manager::FlowManager;
//! use flowstate::registry::FlowRegistry;
//! # use flowstate::flow::{FlowContext, FlowLogic, FlowPoll, ResumeInput};
//! # use flowstate::errors::FlowException;
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct PaymentFlow;
//! # impl FlowLogic for PaymentFlow {
//! #     fn resume(&mut self, _: &mut FlowContext, _: ResumeInput) -> Result<FlowPoll, FlowException> {
//! #         Ok(FlowPoll::finished(Vec::new()))
//! #     }
//! #     fn continuation(&self) -> Result<Vec<u8>, flowstate::checkpoint::codec::CodecError> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = FlowRegistry::new();
//! flowstate::register_flow!(&mut registry, "PaymentFlow", 1, PaymentFlow);
//!
//! let manager = FlowManager::builder("O=Alpha,L=Zurich".into(), registry)
//!     .build()
//!     .await?;
//!
//! // Resume anything left over from the previous run, then take new work.
//! manager.restore().await?;
//! let handle = manager.start_flow("PaymentFlow", b"{}".to_vec()).await?;
//! let result = handle.result().await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution Model
//!
//! Each live flow has one worker with a bounded event inbox; only one event
//! is processed per flow at a time, while workers multiplex onto the tokio
//! pool. A suspension runs synchronously through the transition executor:
//! the checkpoint write commits in the same transaction turn as the
//! suspension's sends, inbound acknowledgements flush only after the
//! commit, and a crash anywhere in between replays with identical
//! deduplication ids so the counterparty's de-duplicator collapses the
//! overlap.
//!
//! ## Module Guide
//!
//! - [`flow`] - The `FlowLogic` trait and capability context user code sees
//! - [`registry`] - Name → constructor dispatch for flow types
//! - [`transition`] - The pure transition function
//! - [`actions`] / [`events`] / [`io`] - The three tagged-variant vocabularies
//! - [`executor`] - Transaction discipline, action application, interceptors
//! - [`checkpoint`] - Checkpoint entity, blob codec, transactional stores
//! - [`manager`] - Start/resume/kill, session routing, shutdown gate
//! - [`bus`] / [`clock`] / [`hospital`] - Collaborator seams
//! - [`monitor`] - Lifecycle event sinks
//! - [`telemetry`] - Tracing bootstrap

pub mod actions;
pub mod bus;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod flow;
pub mod gate;
pub mod hospital;
pub mod ids;
pub mod io;
pub mod manager;
pub mod messages;
pub mod monitor;
pub mod registry;
pub mod telemetry;
pub mod transition;
pub(crate) mod worker;

pub use worker::FlowResult;

// Support for macro expansion in downstream crates.
#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
