//! Contains the [EventSourced] Command Handler, the transactional heart
//! of the crate.
//!
//! Processing a Domain Command goes through the following steps:
//! load the current [AggregateState] through the
//! [Repository][crate::repository::Repository], evaluate the command
//! with [Model::decide], and make the resulting Domain Events, Outbox
//! notifications and command id durable with a single
//! [commit][crate::journal::Committer::commit]. Optimistic-locking
//! conflicts with concurrent writers on the same Event Stream are
//! retried with exponential backoff; business rejections are returned to
//! the caller as values and never retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::Config;
use crate::decision::Decision;
use crate::message::Message;
use crate::model::Model;
use crate::repository::{AggregateState, Repository};
use crate::response::Response;
use crate::snapshot::{self, Snapshot};
use crate::version::{self, Version};
use crate::{command, event, journal};

/// All possible error types returned by [EventSourced::process].
///
/// Business rejections are *not* errors: they are reported through the
/// [Outcome][command::Outcome] value instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A concurrent writer kept winning the optimistic-locking race for
    /// the whole retry budget.
    #[error("failed to commit new domain events, all retries exhausted: {0}")]
    Conflict(#[from] version::ConflictError),

    /// The Journal failed while streaming events during state
    /// reconstruction.
    #[error("failed to load the aggregate state: {0}")]
    Load(#[source] anyhow::Error),

    /// The storage failed while performing the commit.
    #[error("failed to commit the command effects: {0}")]
    Commit(#[source] anyhow::Error),
}

/// Command Handler implementation using an event-sourced
/// [Repository][crate::repository::Repository] to load Aggregate states,
/// a user-supplied [Model] to evaluate commands, and a
/// [journal::Committer] to make their effects durable.
pub struct EventSourced<M, J, S>
where
    M: Model,
{
    model: M,
    journal: J,
    repository: Repository<M, J, S>,
    snapshots: S,
    commands: Arc<dyn command::Store>,
    max_retry: u32,
    retry_initial_delay: Duration,
    record_rejected_commands: bool,
}

impl<M, J, S> EventSourced<M, J, S>
where
    M: Model,
    J: journal::Reader<M::Id, M::Event>
        + journal::Committer<M::Id, M::Event, M::Notification>
        + Clone,
    <J as journal::Reader<M::Id, M::Event>>::Error:
        std::error::Error + Send + Sync + 'static,
    S: snapshot::Store<M::Id, M::State> + Clone,
{
    /// Creates a new [EventSourced] Command Handler.
    pub fn new(
        model: M,
        journal: J,
        snapshots: S,
        commands: Arc<dyn command::Store>,
        config: &Config,
    ) -> Self {
        Self {
            repository: Repository::new(journal.clone(), snapshots.clone()),
            model,
            journal,
            snapshots,
            commands,
            max_retry: config.max_retry,
            retry_initial_delay: config.retry_initial_delay,
            record_rejected_commands: config.record_rejected_commands,
        }
    }

    /// Returns the [Repository] used by the handler to reconstruct
    /// Aggregate states.
    pub fn repository(&self) -> &Repository<M, J, S> {
        &self.repository
    }

    /// Processes a Domain Command, reporting its business
    /// [Outcome][command::Outcome].
    ///
    /// The command id is the idempotency key: processing the same
    /// envelope again after a successful commit performs no new writes
    /// and reports success.
    ///
    /// # Errors
    ///
    /// Infrastructure failures are returned as [Error]s. Version
    /// conflicts are retried with exponential backoff up to the
    /// configured budget before being escalated.
    #[tracing::instrument(
        level = "debug",
        name = "EventSourced::process",
        skip_all,
        fields(command = command.message.name(), command_id = %command.id),
    )]
    pub async fn process(
        &self,
        command: command::Envelope<M::Id, M::Command>,
    ) -> Result<command::Outcome<M::Rejection>, Error> {
        let mut attempt: u32 = 0;

        loop {
            match self.try_process(&command).await {
                Err(Error::Conflict(conflict)) if attempt < self.max_retry => {
                    let delay = self.retry_initial_delay * 2u32.saturating_pow(attempt);

                    tracing::debug!(
                        expected = conflict.expected,
                        actual = conflict.actual,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "version conflict detected, retrying",
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                outcome => return outcome,
            }
        }
    }

    async fn try_process(
        &self,
        command: &command::Envelope<M::Id, M::Command>,
    ) -> Result<command::Outcome<M::Rejection>, Error> {
        if self.commands.contains(&command.id).await {
            tracing::debug!("command already processed, skipping");
            return Ok(Ok(()));
        }

        let aggregate = self
            .repository
            .get(&command.address)
            .await
            .map_err(|error| Error::Load(anyhow::Error::new(error)))?;

        let (state, version) = match aggregate {
            AggregateState::Valid { state, version } => (state, version),
            AggregateState::Conflicted { errors, .. } => {
                // Corrupted stream: refuse the command without running
                // the decider.
                return Ok(Err(errors));
            },
        };

        let Response {
            decision,
            notifications,
        } = self.model.decide(&state, &command.message);

        match decision {
            Decision::Rejected(reasons) => {
                if self.record_rejected_commands {
                    self.commands.add(command.id).await;
                }

                Ok(Err(reasons))
            },

            Decision::Indecisive(()) => {
                if notifications.is_empty() {
                    self.commands.add(command.id).await;
                    return Ok(Ok(()));
                }

                // No events to append: the commit only delivers
                // notifications, so no version check is needed.
                let commit = journal::Commit::new(command.address.clone(), command.id)
                    .with_notifications(notifications);

                self.perform(command, commit, None).await
            },

            Decision::Accepted(events, ()) => {
                let events = events.into_vec();

                // Fold the refreshed snapshot value before the events
                // move into the commit.
                let mut folded: Option<M::State> = Some(state);
                for event in &events {
                    folded = folded.and_then(|state| M::transition(&state, event).ok());
                }

                let envelopes: Vec<event::Envelope<M::Event>> =
                    events.into_iter().map(event::Envelope::from).collect();

                let commit = journal::Commit::new(command.address.clone(), command.id)
                    .expecting(version::Check::MustBe(version))
                    .with_events(envelopes)
                    .with_notifications(notifications);

                self.perform(command, commit, folded).await
            },
        }
    }

    /// Performs the commit, refreshes the snapshot on success and records
    /// the command id as processed.
    async fn perform(
        &self,
        command: &command::Envelope<M::Id, M::Command>,
        commit: journal::Commit<M::Id, M::Event, M::Notification>,
        folded: Option<M::State>,
    ) -> Result<command::Outcome<M::Rejection>, Error> {
        let had_events = !commit.events.is_empty();

        match self.journal.commit(commit).await {
            Ok(committed) => {
                if had_events {
                    self.refresh_snapshot(command, folded, committed.version).await;
                }

                self.commands.add(command.id).await;
                Ok(Ok(()))
            },

            // Another process already committed this very command:
            // idempotency makes this a success.
            Err(journal::CommitError::DuplicateCommand(_)) => {
                tracing::debug!("command already committed elsewhere, skipping");
                self.commands.add(command.id).await;
                Ok(Ok(()))
            },

            Err(journal::CommitError::Conflict(conflict)) => Err(Error::Conflict(conflict)),
            Err(journal::CommitError::Internal(error)) => Err(Error::Commit(error)),
        }
    }

    async fn refresh_snapshot(
        &self,
        command: &command::Envelope<M::Id, M::Command>,
        folded: Option<M::State>,
        version: Version,
    ) {
        let Some(state) = folded else {
            // The model failed to apply its own accepted events; the next
            // Repository::get will rebuild and report the conflict.
            tracing::warn!("accepted events do not fold over the decided state");
            return;
        };

        let snapshot = Snapshot { state, version };

        if let Err(error) = self
            .snapshots
            .put(command.address.clone(), snapshot)
            .await
        {
            tracing::warn!(%error, "failed to refresh snapshot after commit");
        }
    }
}

#[async_trait]
impl<M, J, S> command::Handler<M::Id, M::Command, M::Rejection> for EventSourced<M, J, S>
where
    M: Model,
    J: journal::Reader<M::Id, M::Event>
        + journal::Committer<M::Id, M::Event, M::Notification>
        + Clone,
    <J as journal::Reader<M::Id, M::Event>>::Error:
        std::error::Error + Send + Sync + 'static,
    S: snapshot::Store<M::Id, M::State> + Clone,
{
    type Error = Error;

    async fn handle(
        &self,
        command: command::Envelope<M::Id, M::Command>,
    ) -> Result<command::Outcome<M::Rejection>, Self::Error> {
        self.process(command).await
    }
}
