//! Integration tests for token savings, atomicity and concurrency.
//!
//! These cover the paths the native-only flows don't: allowance-based token
//! pulls, rollback when a transfer or the event log fails, and many callers
//! hitting the ledger at once.

use std::sync::Arc;
use std::thread;

use bitsave_contracts::{Bitsave, BitsaveError, CallContext, CreateSavingParams};
use bitsave_protocol::storage::BitsaveDB;
use bitsave_protocol::{
    Address, BitsaveConfig, EventLog, InMemoryTokenLedger, MemoryEventLog, TokenLedger,
    NATIVE_TOKEN,
};

const NOW: u64 = 1_717_000_000;
const JOIN_FEE: u128 = 100_000_000_000;
const SAVING_FEE: u128 = 100_000_000_000;

fn master() -> Address {
    Address::derive(b"master")
}

fn usdc() -> Address {
    Address::derive(b"usdc")
}

fn points_token() -> Address {
    Address::derive(b"cs-token")
}

fn config() -> BitsaveConfig {
    BitsaveConfig {
        master: master(),
        stable_coin: usdc(),
        cs_token: points_token(),
        ..BitsaveConfig::default()
    }
}

fn setup_with_log(log: Arc<dyn EventLog>) -> (Arc<Bitsave>, Arc<InMemoryTokenLedger>) {
    let tokens = Arc::new(InMemoryTokenLedger::new());
    let bitsave = Arc::new(Bitsave::new(config(), tokens.clone(), log).unwrap());
    (bitsave, tokens)
}

fn setup() -> (Arc<Bitsave>, Arc<InMemoryTokenLedger>) {
    setup_with_log(Arc::new(MemoryEventLog::new()))
}

fn joined(bitsave: &Bitsave, seed: &[u8]) -> Address {
    let user = Address::derive(seed);
    bitsave
        .join_bitsave(CallContext::new(user, NOW).with_value(JOIN_FEE))
        .unwrap();
    user
}

fn token_saving(name: &str, amount: u128, pct: u8) -> CreateSavingParams {
    CreateSavingParams {
        name: name.into(),
        maturity_time: NOW + 86_400,
        penalty_percentage: pct,
        is_safe_mode: true,
        token_id: usdc(),
        amount,
    }
}

fn native_saving(name: &str) -> CreateSavingParams {
    CreateSavingParams {
        token_id: NATIVE_TOKEN,
        amount: 1,
        is_safe_mode: false,
        ..token_saving(name, 1, 5)
    }
}

// ---------------------------------------------------------------------------
// Token savings
// ---------------------------------------------------------------------------

#[test]
fn token_saving_pulls_on_allowance() {
    let (b, tokens) = setup();
    let alice = joined(&b, b"alice");
    let vault = b.user_child_contract_address(alice).unwrap();
    tokens.mint(usdc(), alice, 1_000).unwrap();
    tokens.approve(usdc(), alice, b.address(), 600);

    let receipt = b
        .create_saving(
            CallContext::new(alice, NOW).with_value(SAVING_FEE),
            token_saving("school", 500, 10),
        )
        .unwrap();

    assert_eq!(receipt.output.amount, 500);
    assert!(receipt.output.is_safe_mode);
    assert_eq!(tokens.balance_of(usdc(), alice), 500);
    assert_eq!(tokens.balance_of(usdc(), vault), 500);
    assert_eq!(tokens.allowance(usdc(), alice, b.address()), 100);

    let snapshot = b.vault_snapshot(alice).unwrap();
    assert_eq!(snapshot.balance_of(usdc()), 500);
    assert_eq!(snapshot.native_balance(), SAVING_FEE);
    assert_eq!(snapshot.total_points(), 5_000);
}

#[test]
fn token_saving_without_allowance_changes_nothing() {
    let (b, tokens) = setup();
    let alice = joined(&b, b"alice");
    tokens.mint(usdc(), alice, 1_000).unwrap();
    let events_before = b.events_since(0).unwrap().len();

    let err = b
        .create_saving(
            CallContext::new(alice, NOW).with_value(SAVING_FEE),
            token_saving("school", 500, 10),
        )
        .unwrap_err();

    assert_eq!(err.code(), "TokenTransferFailed");
    assert_eq!(tokens.balance_of(usdc(), alice), 1_000);
    assert!(b.list_savings(alice).unwrap().is_empty());
    assert_eq!(b.vault_snapshot(alice).unwrap().native_balance(), 0);
    assert_eq!(b.events_since(0).unwrap().len(), events_before);
}

#[test]
fn increment_with_wrong_token_is_rejected() {
    let (b, tokens) = setup();
    let alice = joined(&b, b"alice");
    tokens.mint(usdc(), alice, 1_000).unwrap();
    tokens.approve(usdc(), alice, b.address(), 1_000);
    b.create_saving(
        CallContext::new(alice, NOW).with_value(SAVING_FEE),
        token_saving("school", 500, 10),
    )
    .unwrap();

    let err = b
        .increment_saving(
            CallContext::new(alice, NOW).with_value(10),
            "school",
            NATIVE_TOKEN,
            0,
        )
        .unwrap_err();
    assert_eq!(
        err,
        BitsaveError::TokenMismatch {
            name: "school".into(),
            expected: usdc(),
            got: NATIVE_TOKEN,
        }
    );

    let receipt = b
        .increment_saving(CallContext::new(alice, NOW + 5), "school", usdc(), 250)
        .unwrap();
    assert_eq!(receipt.output.amount, 750);
    assert_eq!(receipt.output.interest_accumulated, 7_500);
    assert_eq!(tokens.balance_of(usdc(), alice), 250);
}

#[test]
fn early_token_withdrawal_leaves_penalty_in_vault() {
    let (b, tokens) = setup();
    let alice = joined(&b, b"alice");
    let vault = b.user_child_contract_address(alice).unwrap();
    tokens.mint(usdc(), alice, 1_000).unwrap();
    tokens.approve(usdc(), alice, b.address(), 1_000);
    b.create_saving(
        CallContext::new(alice, NOW).with_value(SAVING_FEE),
        token_saving("school", 1_000, 25),
    )
    .unwrap();

    let receipt = b
        .withdraw_saving(CallContext::new(alice, NOW + 60), "school")
        .unwrap();

    assert_eq!(receipt.output.amount, 750);
    assert_eq!(receipt.output.penalty, 250);
    assert_eq!(tokens.balance_of(usdc(), alice), 750);
    assert_eq!(tokens.balance_of(usdc(), vault), 250);
    assert_eq!(b.vault_snapshot(alice).unwrap().balance_of(usdc()), 250);
    assert_eq!(receipt.events[1].event.kind(), "TokenWithdrawal");
}

#[test]
fn failed_points_payout_rolls_back_principal() {
    let (b, tokens) = setup();
    let alice = joined(&b, b"alice");
    let vault = b.user_child_contract_address(alice).unwrap();
    tokens.mint(usdc(), alice, 1_000).unwrap();
    tokens.approve(usdc(), alice, b.address(), 1_000);
    b.create_saving(
        CallContext::new(alice, NOW).with_value(SAVING_FEE),
        token_saving("school", 1_000, 25),
    )
    .unwrap();

    // The master holds no points tokens.
    let err = b
        .withdraw_saving(CallContext::new(alice, NOW + 86_400), "school")
        .unwrap_err();

    assert_eq!(err.code(), "TokenTransferFailed");
    assert_eq!(tokens.balance_of(usdc(), alice), 0);
    assert_eq!(tokens.balance_of(usdc(), vault), 1_000);
    assert!(b.get_saving(alice, "school").unwrap().is_valid);

    tokens.mint(points_token(), master(), 10_000).unwrap();
    let receipt = b
        .withdraw_saving(CallContext::new(alice, NOW + 86_400), "school")
        .unwrap();
    assert_eq!(receipt.output.points_paid, 10_000);
    assert_eq!(tokens.balance_of(points_token(), alice), 10_000);
    assert_eq!(tokens.balance_of(usdc(), alice), 1_000);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn points_depend_only_on_total_principal() {
    let splits: [&[u128]; 3] = [&[600], &[100, 200, 300], &[300, 200, 100]];
    let mut results = Vec::new();

    for increments in splits {
        let (b, _) = setup();
        let alice = joined(&b, b"alice");
        b.create_saving(
            CallContext::new(alice, NOW).with_value(SAVING_FEE + 400),
            native_saving("rainy day"),
        )
        .unwrap();
        for value in increments {
            b.increment_saving(
                CallContext::new(alice, NOW).with_value(*value),
                "rainy day",
                NATIVE_TOKEN,
                0,
            )
            .unwrap();
        }
        let saving = b.get_saving(alice, "rainy day").unwrap();
        assert_eq!(saving.amount, 1_000);
        results.push((saving.interest_accumulated, b.total_points(alice).unwrap()));
    }

    assert!(results.iter().all(|r| *r == (10_000, 10_000)));
}

#[test]
fn vault_balance_covers_valid_principal() {
    let (b, _) = setup();
    let alice = joined(&b, b"alice");
    for (i, value) in [500u128, 700, 900].into_iter().enumerate() {
        b.create_saving(
            CallContext::new(alice, NOW).with_value(SAVING_FEE + value),
            native_saving(&format!("goal-{i}")),
        )
        .unwrap();
    }
    b.withdraw_saving(CallContext::new(alice, NOW + 1), "goal-1")
        .unwrap();

    let vault = b.vault_snapshot(alice).unwrap();
    let valid_principal: u128 = vault
        .savings()
        .filter(|s| s.is_valid)
        .map(|s| s.amount)
        .sum();
    assert_eq!(valid_principal, 1_400);
    assert!(vault.native_balance() >= valid_principal);
    assert_eq!(vault.reserved_native().unwrap(), valid_principal);
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

#[test]
fn events_persist_in_sled() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Arc::new(BitsaveDB::open(dir.path()).unwrap());
        let (b, _) = setup_with_log(db.clone());
        let alice = joined(&b, b"alice");
        b.create_saving(
            CallContext::new(alice, NOW).with_value(SAVING_FEE + 10),
            native_saving("trip"),
        )
        .unwrap();
        db.flush().unwrap();
    }

    let reopened = BitsaveDB::open(dir.path()).unwrap();
    let records = reopened.since(0).unwrap();
    let kinds: Vec<_> = records.iter().map(|r| r.event.kind()).collect();
    assert_eq!(kinds, vec!["JoinedBitsave", "SavingCreated"]);
    assert_eq!(records[1].timestamp, NOW);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_users_are_independent() {
    let (b, _) = setup();
    let handles: Vec<_> = (0..16u8)
        .map(|i| {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                let user = joined(&b, &[b'u', i]);
                b.create_saving(
                    CallContext::new(user, NOW).with_value(SAVING_FEE + 100),
                    native_saving("goal"),
                )
                .unwrap();
                user
            })
        })
        .collect();
    let users: Vec<Address> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(b.user_count(), 16);
    for user in users {
        assert_eq!(b.total_points(user).unwrap(), 1_000);
    }
    let seqs: Vec<u64> = b.events_since(0).unwrap().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (0..32).collect::<Vec<u64>>());
}

#[test]
fn concurrent_increments_on_one_vault_serialize() {
    let (b, _) = setup();
    let alice = joined(&b, b"alice");
    b.create_saving(
        CallContext::new(alice, NOW).with_value(SAVING_FEE + 1),
        native_saving("goal"),
    )
    .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                for _ in 0..25 {
                    b.increment_saving(
                        CallContext::new(alice, NOW).with_value(2),
                        "goal",
                        NATIVE_TOKEN,
                        0,
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let saving = b.get_saving(alice, "goal").unwrap();
    assert_eq!(saving.amount, 1 + 8 * 25 * 2);
    assert_eq!(b.total_points(alice).unwrap(), saving.amount * 10);
}

#[test]
fn racing_joins_register_once() {
    let (b, _) = setup();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                let ctx = CallContext::new(Address::derive(b"alice"), NOW).with_value(JOIN_FEE);
                b.join_bitsave(ctx).is_ok()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(wins, 1);
    assert_eq!(b.user_count(), 1);
    assert_eq!(b.fee_pool(), config().initial_balance + JOIN_FEE);
}

#[test]
fn user_count_never_lags_visible_registrations() {
    let (b, _) = setup();
    let users: Vec<Address> = (0..200u32)
        .map(|i| Address::derive(&i.to_be_bytes()))
        .collect();

    let reader = {
        let b = Arc::clone(&b);
        let users = users.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                let visible = users.iter().filter(|u| b.is_registered(**u)).count() as u64;
                assert!(b.user_count() >= visible);
            }
        })
    };

    for user in &users {
        b.join_bitsave(CallContext::new(*user, NOW).with_value(JOIN_FEE))
            .unwrap();
    }
    reader.join().unwrap();
    assert_eq!(b.user_count(), 200);
}
