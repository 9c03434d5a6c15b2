//! Module exposing a test [Scenario] type to write [Model] test cases
//! using the [given-then-when canvas](https://www.agilealliance.org/glossary/gwt/).
//!
//! The scenario runs the full command-handling pipeline over the
//! [in-memory driver][crate::inmemory::Store]: Domain Events are seeded
//! in the Journal, the command goes through an
//! [EventSourced][crate::handler::EventSourced] handler, and the
//! assertions inspect what was actually committed -- events, outcome and
//! Outbox notifications.

use std::fmt::Debug;
use std::sync::Arc;

use futures::TryStreamExt;
use uuid::Uuid;

use crate::backend::Config;
use crate::decision::NonEmpty;
use crate::handler::EventSourced;
use crate::journal::{Commit, Committer, Reader};
use crate::model::Model;
use crate::outbox::Store as _;
use crate::version::Version;
use crate::{command, event, inmemory, snapshot};

/// A test scenario to exercise a [Model] through the full
/// command-handling pipeline, using a
/// [given-then-when canvas](https://www.agilealliance.org/glossary/gwt/) approach.
pub struct Scenario<M>
where
    M: Model,
{
    model: M,
}

impl<M> Scenario<M>
where
    M: Model,
{
    /// Starts a new [Scenario] for the provided [Model] value.
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// Sets the precondition state of the system for the [Scenario],
    /// expressed by a list of Domain Events already committed to the
    /// specified Event Stream.
    #[must_use]
    pub fn given(
        self,
        stream_id: M::Id,
        events: Vec<event::Envelope<M::Event>>,
    ) -> ScenarioGiven<M> {
        ScenarioGiven {
            model: self.model,
            given: Some((stream_id, events)),
        }
    }

    /// Specifies the [Command][command::Envelope] to test in the
    /// [Scenario], in the peculiar case of having a clean system.
    #[must_use]
    pub fn when(self, command: command::Envelope<M::Id, M::Command>) -> ScenarioWhen<M> {
        ScenarioWhen {
            model: self.model,
            given: None,
            when: command,
        }
    }
}

#[doc(hidden)]
pub struct ScenarioGiven<M>
where
    M: Model,
{
    model: M,
    given: Option<(M::Id, Vec<event::Envelope<M::Event>>)>,
}

impl<M> ScenarioGiven<M>
where
    M: Model,
{
    /// Specifies the [Command][command::Envelope] to test in the [Scenario].
    #[must_use]
    pub fn when(self, command: command::Envelope<M::Id, M::Command>) -> ScenarioWhen<M> {
        ScenarioWhen {
            model: self.model,
            given: self.given,
            when: command,
        }
    }
}

#[doc(hidden)]
pub struct ScenarioWhen<M>
where
    M: Model,
{
    model: M,
    given: Option<(M::Id, Vec<event::Envelope<M::Event>>)>,
    when: command::Envelope<M::Id, M::Command>,
}

impl<M> ScenarioWhen<M>
where
    M: Model,
{
    /// Sets the expectation on the result of the [Scenario] to be
    /// positive and produce the specified list of Domain Events. Use an
    /// empty list for a command that is expected to be accepted without
    /// effects.
    #[must_use]
    pub fn then(self, events: Vec<event::Envelope<M::Event>>) -> ScenarioThen<M> {
        ScenarioThen {
            model: self.model,
            given: self.given,
            when: self.when,
            case: ScenarioThenCase::Produces {
                events,
                notifications: None,
            },
        }
    }

    /// Sets the expectation on the result of the [Scenario] to be a
    /// rejection with the specified reasons, and no committed effects.
    #[must_use]
    pub fn then_rejects(self, reasons: NonEmpty<M::Rejection>) -> ScenarioThen<M> {
        ScenarioThen {
            model: self.model,
            given: self.given,
            when: self.when,
            case: ScenarioThenCase::Rejects(reasons),
        }
    }
}

enum ScenarioThenCase<M>
where
    M: Model,
{
    Produces {
        events: Vec<event::Envelope<M::Event>>,
        notifications: Option<Vec<M::Notification>>,
    },
    Rejects(NonEmpty<M::Rejection>),
}

#[doc(hidden)]
pub struct ScenarioThen<M>
where
    M: Model,
{
    model: M,
    given: Option<(M::Id, Vec<event::Envelope<M::Event>>)>,
    when: command::Envelope<M::Id, M::Command>,
    case: ScenarioThenCase<M>,
}

impl<M> ScenarioThen<M>
where
    M: Model,
    M::Event: Clone + PartialEq + Debug,
    M::Rejection: PartialEq + Debug,
    M::Notification: Clone + PartialEq + Debug,
{
    /// Additionally expects the specified notifications to be enqueued in
    /// the Outbox, in order.
    #[must_use]
    pub fn and_notifies(mut self, notifications: Vec<M::Notification>) -> Self {
        if let ScenarioThenCase::Produces {
            notifications: expected,
            ..
        } = &mut self.case
        {
            *expected = Some(notifications);
        }

        self
    }

    /// Executes the whole [Scenario] and runs the specified assertions.
    ///
    /// # Panics
    ///
    /// The method panics if the assertion fails.
    pub async fn assert(self) {
        let store = inmemory::Store::<M::Id, M::Event, M::Notification>::default();

        let mut given_count: Version = 0;

        if let Some((stream_id, events)) = &self.given {
            if self.when.address == *stream_id {
                given_count = events.len() as Version;
            }

            store
                .commit(
                    Commit::new(stream_id.clone(), Uuid::new_v4()).with_events(events.clone()),
                )
                .await
                .expect("domain events in 'given' should be inserted in the journal");
        }

        let address = self.when.address.clone();
        let config = Config::default();

        let handler = EventSourced::new(
            self.model,
            store.clone(),
            snapshot::InMemory::new(config.snapshots.max_in_mem),
            Arc::new(command::Lru::new(config.command_cache_size)),
            &config,
        );

        let outcome = handler
            .process(self.when)
            .await
            .expect("command handling should not fail");

        match self.case {
            ScenarioThenCase::Produces {
                events,
                notifications,
            } => {
                assert!(outcome.is_ok(), "the command should not be rejected");

                let recorded: Vec<event::Envelope<M::Event>> = store
                    .stream(&address, event::VersionSelect::From(given_count + 1))
                    .map_ok(|persisted| persisted.event)
                    .try_collect()
                    .await
                    .expect("streaming the recorded events should not fail");

                assert_eq!(events, recorded);

                if let Some(expected) = notifications {
                    let pending: Vec<M::Notification> = store
                        .pending()
                        .map_ok(|item| item.notification)
                        .try_collect()
                        .await
                        .expect("streaming the pending outbox items should not fail");

                    assert_eq!(expected, pending);
                }
            },
            ScenarioThenCase::Rejects(reasons) => {
                assert_eq!(Err(reasons), outcome);

                let recorded: Vec<_> = store
                    .stream(&address, event::VersionSelect::From(given_count + 1))
                    .try_collect()
                    .await
                    .expect("streaming the recorded events should not fail");

                assert!(recorded.is_empty(), "a rejected command commits no events");

                let pending: Vec<_> = store
                    .pending()
                    .try_collect()
                    .await
                    .expect("streaming the pending outbox items should not fail");

                assert!(
                    pending.is_empty(),
                    "a rejected command enqueues no notifications",
                );
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::tests::{
        Tally, TallyCommand, TallyEvent, TallyNotification, TallyRejection,
    };

    const STREAM_ID: &str = "tally:test";

    #[tokio::test]
    async fn it_records_an_increment_and_its_notification() {
        Scenario::new(Tally)
            .when(command::Envelope::new(
                STREAM_ID.to_owned(),
                TallyCommand::Increment,
            ))
            .then(vec![event::Envelope::from(TallyEvent::Incremented)])
            .and_notifies(vec![TallyNotification::Changed { total: 1 }])
            .assert()
            .await;
    }

    #[tokio::test]
    async fn it_decrements_a_positive_tally() {
        Scenario::new(Tally)
            .given(
                STREAM_ID.to_owned(),
                vec![event::Envelope::from(TallyEvent::Incremented)],
            )
            .when(command::Envelope::new(
                STREAM_ID.to_owned(),
                TallyCommand::Decrement,
            ))
            .then(vec![event::Envelope::from(TallyEvent::Decremented)])
            .assert()
            .await;
    }

    #[tokio::test]
    async fn it_rejects_a_decrement_on_an_empty_tally() {
        Scenario::new(Tally)
            .when(command::Envelope::new(
                STREAM_ID.to_owned(),
                TallyCommand::Decrement,
            ))
            .then_rejects(NonEmpty::new(TallyRejection::WouldGoNegative))
            .assert()
            .await;
    }

    #[tokio::test]
    async fn a_noop_command_is_accepted_without_effects() {
        Scenario::new(Tally)
            .when(command::Envelope::new(
                STREAM_ID.to_owned(),
                TallyCommand::Noop,
            ))
            .then(vec![])
            .assert()
            .await;
    }
}
