//! Foundation trait for describing a Domain model as an event-driven
//! state machine.
//!
//! A [Model] packages the two pure functions the rest of the crate is
//! parameterised over:
//!
//! * [`transition`](Model::transition), folding one Domain Event over the
//!   current state to produce the next one;
//! * [`decide`](Model::decide), evaluating a Domain Command against the
//!   current state to produce a [Response]: a [Decision] plus the
//!   notifications to deliver downstream.
//!
//! State reconstruction is the left fold of [`transition`](Model::transition)
//! over the Event Stream, performed by the
//! [Repository][crate::repository::Repository]; command evaluation is
//! performed by the [EventSourced][crate::handler::EventSourced] command
//! handler.

use std::fmt::Debug;
use std::hash::Hash;

use crate::decision::{Decision, NonEmpty};
use crate::message;
use crate::response::Response;

/// An event-driven state machine describing a single Aggregate type:
/// its state, the Domain Events mutating it, the Domain Commands it
/// accepts, and the notifications it publishes.
///
/// The trait is implemented on a carrier type which may hold the
/// dependencies needed to evaluate commands (validators, clocks, etc.),
/// while [`transition`](Model::transition) stays a pure associated
/// function so that replaying history can never perform side effects.
pub trait Model: Send + Sync {
    /// Unique identifier of an Aggregate instance, also identifying its
    /// Event Stream in the Journal.
    type Id: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// State of the Aggregate, reconstructed by folding its Domain Events.
    type State: Clone + Send + Sync + 'static;

    /// Represents a specific, domain-related change to the Aggregate state.
    type Event: message::Message + Send + Sync + 'static;

    /// Commands are all the possible operations available on the Aggregate.
    type Command: message::Message + Send + Sync + 'static;

    /// Reason for refusing a Domain Command, or for failing to apply a
    /// Domain Event during replay.
    type Rejection: Send + Sync + 'static;

    /// Outbound message published when a command is accepted, delivered
    /// at-least-once through the [Outbox][crate::outbox].
    type Notification: message::Message + Send + Sync + 'static;

    /// The state of an Aggregate instance with no Domain Events recorded.
    fn initial() -> Self::State;

    /// Applies a Domain Event to the current state, returning the next
    /// state or the reasons why the event is invalid given the current
    /// one.
    ///
    /// An error here marks the Event Stream as
    /// [Conflicted][crate::repository::AggregateState::Conflicted]: the
    /// stream contains corrupted or unexpected data and no later event
    /// will be applied.
    fn transition(
        state: &Self::State,
        event: &Self::Event,
    ) -> Result<Self::State, NonEmpty<Self::Rejection>>;

    /// Evaluates a Domain Command against the current state.
    fn decide(&self, state: &Self::State, command: &Self::Command) -> ResponseOf<Self>;
}

/// The [Decision] type produced by a [Model]'s command evaluation.
pub type DecisionOf<M> =
    Decision<<M as Model>::Rejection, <M as Model>::Event>;

/// The [Response] type produced by [Model::decide].
pub type ResponseOf<M> =
    Response<<M as Model>::Rejection, <M as Model>::Event, <M as Model>::Notification>;
