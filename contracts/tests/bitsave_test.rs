//! Integration tests for the Bitsave ledger.
//!
//! These walk the user-facing flows end to end: deployment, joining,
//! creating, incrementing and withdrawing native savings, and the events
//! each step commits.

use std::sync::Arc;

use bitsave_contracts::{Bitsave, BitsaveError, CallContext, ChildVault, CreateSavingParams};
use bitsave_protocol::{
    parse_ether, Address, BitsaveConfig, BitsaveEvent, InMemoryTokenLedger, MemoryEventLog,
    TokenLedger, NATIVE_TOKEN,
};

const NOW: u64 = 1_717_000_000;

fn ether(s: &str) -> u128 {
    parse_ether(s).unwrap()
}

fn cs_token() -> Address {
    Address::derive(b"cs-token")
}

struct Fixture {
    bitsave: Bitsave,
    tokens: Arc<InMemoryTokenLedger>,
    owner: Address,
    user_one: Address,
    opted_user: Address,
}

/// Deploys with the owner as master, then registers `opted_user` and the
/// owner.
fn deploy() -> Fixture {
    let owner = Address::derive(b"owner");
    let config = BitsaveConfig {
        master: owner,
        cs_token: cs_token(),
        ..BitsaveConfig::default()
    };
    let tokens = Arc::new(InMemoryTokenLedger::new());
    let bitsave = Bitsave::new(config, tokens.clone(), Arc::new(MemoryEventLog::new())).unwrap();

    let fixture = Fixture {
        bitsave,
        tokens,
        owner,
        user_one: Address::derive(b"user_one"),
        opted_user: Address::derive(b"opted_user"),
    };
    let fee = fixture.bitsave.join_fee();
    fixture
        .bitsave
        .join_bitsave(CallContext::new(fixture.opted_user, NOW).with_value(fee))
        .unwrap();
    fixture
        .bitsave
        .join_bitsave(CallContext::new(fixture.owner, NOW).with_value(fee))
        .unwrap();
    fixture
}

fn hospital_fee() -> CreateSavingParams {
    CreateSavingParams {
        name: "Hospital Fee".into(),
        maturity_time: NOW + 3_000,
        penalty_percentage: 1,
        is_safe_mode: false,
        token_id: NATIVE_TOKEN,
        amount: ether("0.1"),
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

#[test]
fn deployment_sets_addresses_and_counts() {
    let f = deploy();
    assert_eq!(
        f.bitsave.stable_coin(),
        "0xac485391EB2d7D88253a7F1eF18C37f4242D1A24"
            .parse::<Address>()
            .unwrap()
    );
    assert_eq!(f.bitsave.cs_token(), cs_token());
    assert_eq!(f.bitsave.master_address(), f.owner);
    assert_eq!(f.bitsave.user_count(), 2);
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

#[test]
fn join_returns_vault_owned_by_caller() {
    let f = deploy();
    let vault = f.bitsave.user_child_contract_address(f.owner).unwrap();

    assert!(!vault.is_zero());
    assert_eq!(vault, ChildVault::derive_address(f.owner));
    assert_eq!(f.bitsave.vault_snapshot(vault).unwrap().owner(), f.owner);
}

#[test]
fn join_below_fee_is_rejected() {
    let f = deploy();
    let err = f
        .bitsave
        .join_bitsave(CallContext::new(f.user_one, NOW).with_value(2))
        .unwrap_err();

    assert_eq!(err.code(), "AmountNotEnough");
    assert!(!f.bitsave.is_registered(f.user_one));
    assert_eq!(f.bitsave.user_count(), 2);
}

#[test]
fn join_emits_joined_bitsave() {
    let f = deploy();
    let receipt = f
        .bitsave
        .join_bitsave(CallContext::new(f.user_one, NOW).with_value(f.bitsave.join_fee()))
        .unwrap();

    assert_eq!(
        receipt.events[0].event,
        BitsaveEvent::JoinedBitsave { user: f.user_one }
    );
    assert_eq!(f.bitsave.user_count(), 3);
}

#[test]
fn second_join_is_rejected() {
    let f = deploy();
    let err = f
        .bitsave
        .join_bitsave(CallContext::new(f.owner, NOW).with_value(f.bitsave.join_fee()))
        .unwrap_err();
    assert_eq!(err, BitsaveError::UserAlreadyRegistered(f.owner));
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[test]
fn create_requires_membership() {
    let f = deploy();
    let err = f
        .bitsave
        .create_saving(
            CallContext::new(f.user_one, NOW).with_value(ether("0.5")),
            hospital_fee(),
        )
        .unwrap_err();
    assert_eq!(err, BitsaveError::UserNotRegistered(f.user_one));
}

#[test]
fn create_stores_all_terms() {
    let f = deploy();
    let vault = f.bitsave.user_child_contract_address(f.owner).unwrap();
    let before = f.bitsave.vault_snapshot(vault).unwrap().native_balance();

    f.bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();

    let saving = f.bitsave.get_saving(vault, "Hospital Fee").unwrap();
    assert!(saving.is_valid);
    assert_ne!(saving.amount, 0);
    assert_eq!(saving.amount, ether("0.1"));
    assert_eq!(saving.interest_accumulated, saving.amount * 10);
    assert_eq!(saving.token_id, NATIVE_TOKEN);
    assert_eq!(saving.maturity_time, NOW + 3_000);
    assert_eq!(saving.penalty_percentage, 1);
    assert_eq!(saving.start_time, NOW);

    let after = f.bitsave.vault_snapshot(vault).unwrap().native_balance();
    assert!(after - before >= f.bitsave.saving_fee());
}

#[test]
fn create_without_fee_is_rejected() {
    let f = deploy();
    let err = f
        .bitsave
        .create_saving(CallContext::new(f.owner, NOW), hospital_fee())
        .unwrap_err();
    assert_eq!(err.code(), "NotEnoughToPayGasFee");
}

#[test]
fn create_with_only_the_fee_attached_is_rejected() {
    let f = deploy();
    let vault = f.bitsave.user_child_contract_address(f.owner).unwrap();
    let before = f.bitsave.vault_snapshot(vault).unwrap();

    let err = f
        .bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee()),
            hospital_fee(),
        )
        .unwrap_err();
    assert_eq!(err, BitsaveError::ZeroAmount);

    let after = f.bitsave.vault_snapshot(vault).unwrap();
    assert_eq!(after.native_balance(), before.native_balance());
    assert_eq!(after.total_points(), 0);
    assert!(f.bitsave.list_savings(vault).unwrap().is_empty());
}

#[test]
fn create_with_past_maturity_is_rejected() {
    let f = deploy();
    let params = CreateSavingParams {
        maturity_time: NOW - 3_000,
        ..hospital_fee()
    };
    let err = f
        .bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            params,
        )
        .unwrap_err();
    assert_eq!(err.code(), "InvalidTime");
}

#[test]
fn duplicate_name_is_rejected() {
    let f = deploy();
    let ctx = CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1"));
    let first = f.bitsave.create_saving(ctx, hospital_fee()).unwrap().output;
    assert_ne!(first.amount, 0);

    let err = f.bitsave.create_saving(ctx, hospital_fee()).unwrap_err();
    assert_eq!(err.code(), "InvalidSaving");
    let kept = f.bitsave.get_saving(f.owner, "Hospital Fee").unwrap();
    assert_eq!(kept, first);
}

#[test]
fn create_sends_value_to_vault() {
    let f = deploy();
    let vault = f.bitsave.user_child_contract_address(f.owner).unwrap();
    let before = f.bitsave.vault_snapshot(vault).unwrap().native_balance();

    f.bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();

    let after = f.bitsave.vault_snapshot(vault).unwrap().native_balance();
    assert!(after - before > f.bitsave.saving_fee());
}

#[test]
fn create_adds_ten_times_principal_in_points() {
    let f = deploy();
    assert_eq!(f.bitsave.total_points(f.owner).unwrap(), 0);

    f.bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();

    let saving = f.bitsave.get_saving(f.owner, "Hospital Fee").unwrap();
    let points = f.bitsave.total_points(f.owner).unwrap();
    assert_eq!(points, saving.interest_accumulated);
    assert_eq!(points, ether("0.1") * 10);
}

#[test]
fn create_emits_saving_created() {
    let f = deploy();
    let receipt = f
        .bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();

    assert_eq!(
        receipt.events[0].event,
        BitsaveEvent::SavingCreated {
            user: f.owner,
            name: "Hospital Fee".into(),
            amount: ether("0.1"),
            token_id: NATIVE_TOKEN,
        }
    );
}

// ---------------------------------------------------------------------------
// Increment
// ---------------------------------------------------------------------------

#[test]
fn increment_adds_value_and_recomputes_points() {
    let f = deploy();
    let vault = f.bitsave.user_child_contract_address(f.owner).unwrap();
    f.bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();
    let before = f.bitsave.vault_snapshot(vault).unwrap().native_balance();

    let receipt = f
        .bitsave
        .increment_saving(
            CallContext::new(f.owner, NOW + 10).with_value(ether("0.06")),
            "Hospital Fee",
            NATIVE_TOKEN,
            0,
        )
        .unwrap();

    let after = f.bitsave.vault_snapshot(vault).unwrap().native_balance();
    assert!(after - before >= ether("0.06"));
    assert_eq!(receipt.output.amount, ether("0.16"));
    assert_eq!(receipt.output.interest_accumulated, ether("0.16") * 10);
    assert_eq!(f.bitsave.total_points(f.owner).unwrap(), ether("0.16") * 10);
    assert_eq!(receipt.events[0].event.kind(), "SavingIncremented");
}

#[test]
fn increment_of_unknown_saving_is_rejected() {
    let f = deploy();
    let err = f
        .bitsave
        .increment_saving(
            CallContext::new(f.owner, NOW).with_value(ether("0.06")),
            "Holiday",
            NATIVE_TOKEN,
            0,
        )
        .unwrap_err();
    assert_eq!(err.code(), "InvalidSaving");
}

#[test]
fn increment_with_nothing_attached_is_rejected() {
    let f = deploy();
    f.bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();
    let err = f
        .bitsave
        .increment_saving(CallContext::new(f.owner, NOW), "Hospital Fee", NATIVE_TOKEN, 0)
        .unwrap_err();
    assert_eq!(err, BitsaveError::ZeroAmount);
}

// ---------------------------------------------------------------------------
// Withdraw
// ---------------------------------------------------------------------------

#[test]
fn mature_withdrawal_pays_full_principal_and_points() {
    let f = deploy();
    f.tokens.mint(cs_token(), f.owner, ether("100")).unwrap();
    f.bitsave
        .create_saving(
            CallContext::new(f.opted_user, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();

    let receipt = f
        .bitsave
        .withdraw_saving(CallContext::new(f.opted_user, NOW + 4_000), "Hospital Fee")
        .unwrap();

    assert_eq!(receipt.output.amount, ether("0.1"));
    assert_eq!(receipt.output.penalty, 0);
    assert_eq!(receipt.output.points_paid, ether("1"));
    assert!(
        !f.bitsave
            .get_saving(f.opted_user, "Hospital Fee")
            .unwrap()
            .is_valid
    );

    let kinds: Vec<_> = receipt.events.iter().map(|r| r.event.kind()).collect();
    assert_eq!(
        kinds,
        vec!["SavingWithdrawn", "NativeTransfer", "TokenWithdrawal"]
    );
    // Points are paid by the master in the points token.
    assert_eq!(f.tokens.balance_of(cs_token(), f.owner), ether("99"));
    assert_eq!(f.tokens.balance_of(cs_token(), f.opted_user), ether("1"));

    let err = f
        .bitsave
        .withdraw_saving(CallContext::new(f.opted_user, NOW + 4_001), "Hospital Fee")
        .unwrap_err();
    assert_eq!(err.code(), "InvalidSaving");
}

#[test]
fn early_withdrawal_keeps_penalty_in_vault() {
    let f = deploy();
    let vault = f.bitsave.user_child_contract_address(f.owner).unwrap();
    f.bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();

    let receipt = f
        .bitsave
        .withdraw_saving(CallContext::new(f.owner, NOW + 100), "Hospital Fee")
        .unwrap();

    assert_eq!(receipt.output.penalty, ether("0.001"));
    assert_eq!(receipt.output.amount, ether("0.099"));
    assert_eq!(receipt.output.points_paid, 0);
    assert_eq!(
        receipt.events[0].event,
        BitsaveEvent::SavingWithdrawn {
            user: f.owner,
            name: "Hospital Fee".into(),
            amount: ether("0.099"),
            penalty: ether("0.001"),
        }
    );
    assert_eq!(
        f.bitsave.vault_snapshot(vault).unwrap().native_balance(),
        f.bitsave.saving_fee() + ether("0.001")
    );
    // Points survive the withdrawal.
    assert_eq!(f.bitsave.total_points(f.owner).unwrap(), ether("1"));
}

#[test]
fn withdrawn_name_can_be_reused() {
    let f = deploy();
    let ctx = CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1"));
    f.bitsave.create_saving(ctx, hospital_fee()).unwrap();
    f.bitsave
        .withdraw_saving(CallContext::new(f.owner, NOW + 3_000), "Hospital Fee")
        .unwrap();

    let later = CallContext::new(f.owner, NOW + 5_000)
        .with_value(f.bitsave.saving_fee() + ether("0.2"));
    let params = CreateSavingParams {
        maturity_time: NOW + 9_000,
        ..hospital_fee()
    };
    let receipt = f.bitsave.create_saving(later, params).unwrap();

    assert!(receipt.output.is_valid);
    assert_eq!(receipt.output.amount, ether("0.2"));
    assert_eq!(f.bitsave.list_savings(f.owner).unwrap().len(), 1);
    assert_eq!(f.bitsave.total_points(f.owner).unwrap(), ether("3"));
}

#[test]
fn events_are_numbered_in_commit_order() {
    let f = deploy();
    f.bitsave
        .create_saving(
            CallContext::new(f.owner, NOW).with_value(f.bitsave.saving_fee() + ether("0.1")),
            hospital_fee(),
        )
        .unwrap();

    let all = f.bitsave.events_since(0).unwrap();
    let seqs: Vec<u64> = all.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert_eq!(f.bitsave.events_since(2).unwrap()[0].event.kind(), "SavingCreated");
}
