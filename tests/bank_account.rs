//! Acceptance tests exercising the whole command-handling pipeline over
//! a small bank-accounting domain, using the in-memory storage driver.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tokio::sync::Barrier;

use decree::backend::{Backend, Config};
use decree::decision::{Decision, NonEmpty};
use decree::journal::Reader;
use decree::model::{Model, ResponseOf};
use decree::outbox::Store as OutboxStore;
use decree::repository::AggregateState;
use decree::response::Response;
use decree::{command, event, inmemory, message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountCommand {
    Deposit(u64),
    Withdraw(u64),
}

impl message::Message for AccountCommand {
    fn name(&self) -> &'static str {
        match self {
            AccountCommand::Deposit(_) => "DepositAmount",
            AccountCommand::Withdraw(_) => "WithdrawAmount",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountEvent {
    Deposited(u64),
    Withdrawn(u64),
}

impl message::Message for AccountEvent {
    fn name(&self) -> &'static str {
        match self {
            AccountEvent::Deposited(_) => "AmountWasDeposited",
            AccountEvent::Withdrawn(_) => "AmountWasWithdrawn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountRejection {
    InsufficientFunds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountNotification {
    Deposited(u64),
    Withdrawn(u64),
}

impl message::Message for AccountNotification {
    fn name(&self) -> &'static str {
        match self {
            AccountNotification::Deposited(_) => "AmountWasDeposited",
            AccountNotification::Withdrawn(_) => "AmountWasWithdrawn",
        }
    }
}

struct Account;

impl Model for Account {
    type Id = String;
    type State = u64;
    type Event = AccountEvent;
    type Command = AccountCommand;
    type Rejection = AccountRejection;
    type Notification = AccountNotification;

    fn initial() -> Self::State {
        0
    }

    fn transition(
        state: &Self::State,
        event: &Self::Event,
    ) -> Result<Self::State, NonEmpty<Self::Rejection>> {
        match event {
            AccountEvent::Deposited(amount) => Ok(state + amount),
            AccountEvent::Withdrawn(amount) if state >= amount => Ok(state - amount),
            AccountEvent::Withdrawn(_) => {
                Err(NonEmpty::new(AccountRejection::InsufficientFunds))
            },
        }
    }

    fn decide(&self, state: &Self::State, command: &Self::Command) -> ResponseOf<Self> {
        match command {
            AccountCommand::Deposit(amount) => {
                Response::from(Decision::accept(AccountEvent::Deposited(*amount)))
                    .publish(AccountNotification::Deposited(*amount))
            },
            AccountCommand::Withdraw(amount) if state >= amount => {
                Response::from(Decision::accept(AccountEvent::Withdrawn(*amount)))
                    .publish(AccountNotification::Withdrawn(*amount))
            },
            AccountCommand::Withdraw(_) => {
                Response::from(Decision::reject(AccountRejection::InsufficientFunds))
            },
        }
    }
}

type AccountStore = inmemory::Store<String, AccountEvent, AccountNotification>;
type AccountBackend =
    Backend<Account, AccountStore, decree::snapshot::InMemory<String, u64>>;

fn backend(store: &AccountStore) -> AccountBackend {
    let config = Config {
        retry_initial_delay: Duration::from_millis(5),
        ..Config::default()
    };

    Backend::new(Account, store.clone(), config)
}

#[tokio::test]
async fn a_deposit_commits_its_event_and_notification_atomically() {
    let store = AccountStore::default();
    let backend = backend(&store);
    let account = "account-1".to_owned();

    let outcome = backend
        .process(command::Envelope::new(
            account.clone(),
            AccountCommand::Deposit(100),
        ))
        .await
        .expect("command handling should not fail");

    assert_eq!(Ok(()), outcome);

    let events: Vec<_> = store
        .stream(&account, event::VersionSelect::All)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(1, events.len());
    assert_eq!(1, events[0].seq_nr);
    assert_eq!(1, events[0].version);
    assert_eq!(AccountEvent::Deposited(100), events[0].event.message);

    let pending: Vec<_> = store.pending().try_collect().await.unwrap();

    assert_eq!(1, pending.len());
    assert_eq!(AccountNotification::Deposited(100), pending[0].notification);
    assert_eq!(account, pending[0].stream_id);

    let state = backend.repository().get(&account).await.unwrap();

    assert_eq!(
        AggregateState::Valid {
            state: 100,
            version: 1,
        },
        state,
    );
}

#[tokio::test]
async fn an_overdraft_is_rejected_without_any_write() {
    let store = AccountStore::default();
    let backend = backend(&store);
    let account = "account-2".to_owned();

    let outcome = backend
        .process(command::Envelope::new(
            account.clone(),
            AccountCommand::Withdraw(10),
        ))
        .await
        .expect("command handling should not fail");

    assert_eq!(
        Err(NonEmpty::new(AccountRejection::InsufficientFunds)),
        outcome,
    );

    let events: Vec<_> = store
        .stream(&account, event::VersionSelect::All)
        .try_collect()
        .await
        .unwrap();
    let pending: Vec<_> = store.pending().try_collect().await.unwrap();

    assert!(events.is_empty());
    assert!(pending.is_empty());

    let state = backend.repository().get(&account).await.unwrap();

    assert_eq!(
        AggregateState::Valid {
            state: 0,
            version: 0,
        },
        state,
    );
}

#[tokio::test]
async fn resubmitting_a_processed_command_performs_no_new_writes() {
    let store = AccountStore::default();
    let backend = backend(&store);
    let account = "account-3".to_owned();

    let envelope = command::Envelope::new(account.clone(), AccountCommand::Deposit(100));

    assert_eq!(Ok(()), backend.process(envelope.clone()).await.unwrap());
    assert_eq!(Ok(()), backend.process(envelope).await.unwrap());

    let events: Vec<_> = store
        .stream(&account, event::VersionSelect::All)
        .try_collect()
        .await
        .unwrap();
    let pending: Vec<_> = store.pending().try_collect().await.unwrap();

    assert_eq!(1, events.len());
    assert_eq!(1, pending.len());

    let state = backend.repository().get(&account).await.unwrap();

    assert_eq!(
        AggregateState::Valid {
            state: 100,
            version: 1,
        },
        state,
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_deposits_on_the_same_account_both_land() {
    let store = AccountStore::default();
    let backend = Arc::new(backend(&store));
    let account = "account-4".to_owned();

    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();

    for _ in 0..2 {
        let backend = backend.clone();
        let barrier = barrier.clone();
        let account = account.clone();

        handles.push(tokio::spawn(async move {
            barrier.wait().await;

            backend
                .process(command::Envelope::new(
                    account,
                    AccountCommand::Deposit(50),
                ))
                .await
                .expect("command handling should not fail")
        }));
    }

    for handle in handles {
        assert_eq!(Ok(()), handle.await.unwrap());
    }

    let state = backend.repository().get(&account).await.unwrap();

    assert_eq!(
        AggregateState::Valid {
            state: 100,
            version: 2,
        },
        state,
    );

    let events: Vec<_> = store
        .stream(&account, event::VersionSelect::All)
        .try_collect()
        .await
        .unwrap();

    let versions: Vec<u64> = events.iter().map(|evt| evt.version).collect();
    assert_eq!(vec![1, 2], versions);

    // One notification per deposit, enqueued in commit order.
    let pending: Vec<_> = store.pending().try_collect().await.unwrap();

    assert_eq!(2, pending.len());
    assert!(pending[0].seq_nr < pending[1].seq_nr);
}

#[tokio::test]
async fn a_poisoned_stream_rejects_commands_immediately() {
    use decree::journal::{Commit, Committer};

    let store = AccountStore::default();
    let account = "account-5".to_owned();

    // A withdrawal on an empty account slips into the journal: replaying
    // it can never succeed.
    store
        .commit(
            Commit::new(account.clone(), uuid::Uuid::new_v4())
                .with_events(vec![event::Envelope::from(AccountEvent::Withdrawn(50))]),
        )
        .await
        .unwrap();

    let backend = backend(&store);

    let state = backend.repository().get(&account).await.unwrap();

    match &state {
        AggregateState::Conflicted {
            last,
            on_event,
            errors,
            ..
        } => {
            assert_eq!(&0, last);
            assert_eq!(AccountEvent::Withdrawn(50), on_event.event.message);
            assert_eq!(
                &NonEmpty::new(AccountRejection::InsufficientFunds),
                errors,
            );
        },
        other => panic!("expected a conflicted state, got: {other:?}"),
    }

    let outcome = backend
        .process(command::Envelope::new(
            account.clone(),
            AccountCommand::Deposit(10),
        ))
        .await
        .unwrap();

    assert_eq!(
        Err(NonEmpty::new(AccountRejection::InsufficientFunds)),
        outcome,
    );

    // The stream is untouched.
    let events: Vec<_> = store
        .stream(&account, event::VersionSelect::All)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(1, events.len());
}

#[tokio::test]
async fn unacknowledged_outbox_items_are_delivered_again() {
    let store = AccountStore::default();
    let backend = backend(&store);
    let account = "account-6".to_owned();

    backend
        .process(command::Envelope::new(
            account.clone(),
            AccountCommand::Deposit(25),
        ))
        .await
        .unwrap()
        .expect("the deposit should be accepted");

    // First consumer reads the item but crashes before acknowledging.
    let first_delivery = {
        let relay = backend.outbox();
        let mut stream = relay.stream();

        stream
            .next()
            .await
            .expect("the outbox should have one pending item")
            .unwrap()
    };

    assert_eq!(
        AccountNotification::Deposited(25),
        first_delivery.notification,
    );

    // A fresh consumer sees the very same item again.
    let relay = backend.outbox();
    let mut stream = relay.stream();

    let second_delivery = stream
        .next()
        .await
        .expect("the unacknowledged item should be delivered again")
        .unwrap();

    assert_eq!(first_delivery.seq_nr, second_delivery.seq_nr);
    assert_eq!(first_delivery.notification, second_delivery.notification);

    relay.mark_all_as_sent(vec![second_delivery]).await.unwrap();

    let pending: Vec<_> = store.pending().try_collect().await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn the_outbox_relay_wakes_up_on_new_commits() {
    let store = AccountStore::default();
    let backend = backend(&store);
    let account = "account-7".to_owned();

    let relay = backend.outbox();
    let mut stream = relay.stream();

    backend
        .process(command::Envelope::new(
            account.clone(),
            AccountCommand::Deposit(75),
        ))
        .await
        .unwrap()
        .expect("the deposit should be accepted");

    let delivered = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("the relay should wake up on the commit")
        .expect("the relay stream should not end")
        .unwrap();

    assert_eq!(AccountNotification::Deposited(75), delivered.notification);
}

#[tokio::test]
async fn commits_show_up_on_the_changes_feed() {
    let store = AccountStore::default();
    let backend = backend(&store);
    let account = "account-8".to_owned();

    let mut changes = backend.changes();

    backend
        .process(command::Envelope::new(
            account.clone(),
            AccountCommand::Deposit(5),
        ))
        .await
        .unwrap()
        .expect("the deposit should be accepted");

    let touched = tokio::time::timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("the changes feed should receive the commit")
        .expect("the changes feed should not end");

    assert_eq!(account, touched);
}
