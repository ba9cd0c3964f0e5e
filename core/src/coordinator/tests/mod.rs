//! Coordinator integration tests: a full coordinator over the in-memory
//! pool, mock provers and the mock chain client.

mod forging;
mod recovery;

use std::time::Duration;

use super::*;
use crate::types::{BatchRef, EthStats, ScVariables, Slot, SyncRollupStats};

fn forger_addr() -> Address {
    let mut addr = [0u8; 20];
    addr[0] = 0xaa;
    addr
}

fn other_addr() -> Address {
    let mut addr = [0u8; 20];
    addr[0] = 0xbb;
    addr
}

fn test_consts() -> AuctionConsts {
    AuctionConsts {
        genesis_block_num: 0,
        blocks_per_slot: 40,
    }
}

fn test_vars() -> ScVariables {
    ScVariables {
        forge_l1_l2_batch_timeout: 1000,
        slot_deadline: 20,
    }
}

fn test_slot(slot_num: i64, forger: Address) -> Slot {
    Slot {
        slot_num,
        start_block: slot_num * 40,
        end_block: slot_num * 40 + 39,
        forger,
        forger_commitment: false,
    }
}

/// Synced stats at `block_num` with `forger` winning the current and next
/// slot.
fn stats_at(block_num: BlockNum, batch_num: BatchNum, forger: Address) -> SyncStats {
    stats_at_slot(0, block_num, batch_num, forger)
}

fn stats_at_slot(
    slot_num: i64,
    block_num: BlockNum,
    batch_num: BatchNum,
    forger: Address,
) -> SyncStats {
    SyncStats {
        eth: EthStats {
            last_block: block_num,
            last_batch: batch_num,
        },
        sync: SyncRollupStats {
            last_block: block_num,
            last_batch: BatchRef {
                batch_num,
                forger,
                state_root: [0u8; 32],
            },
            last_l1_batch_block: 0,
            last_forge_l1_txs_num: -1,
            current_slot: test_slot(slot_num, forger),
            next_slot: test_slot(slot_num + 1, forger),
        },
    }
}

/// Config with short intervals and slot commitment ignored, so batches with
/// txs forge immediately and empty ones are skipped.
fn test_cfg(forger: Address) -> Config {
    Config {
        forger_address: forger,
        ignore_slot_commitment: true,
        forge_no_txs_delay: Duration::from_secs(10),
        forge_retry_interval: Duration::from_millis(50),
        tx_manager_check_interval: Duration::from_millis(50),
        eth_client_attempts_delay: Duration::from_millis(10),
        sync_retry_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_can_forge_winner() {
    let consts = test_consts();
    let current = test_slot(0, forger_addr());
    let next = test_slot(1, forger_addr());
    assert!(can_forge(&consts, 20, &current, &next, &forger_addr(), 5, true));
    assert!(!can_forge(&consts, 20, &current, &next, &other_addr(), 5, true));
}

#[test]
fn test_can_forge_after_slot_deadline() {
    let consts = test_consts();
    let current = test_slot(0, forger_addr());
    let next = test_slot(1, forger_addr());
    // relative block 25 is past the deadline of 20 and the winner has not
    // committed, so anyone configured to jump in can forge
    assert!(can_forge(&consts, 20, &current, &next, &other_addr(), 25, true));
    assert!(!can_forge(&consts, 20, &current, &next, &other_addr(), 25, false));
    // a committed slot stays exclusive
    let committed = Slot {
        forger_commitment: true,
        ..current
    };
    assert!(!can_forge(&consts, 20, &committed, &next, &other_addr(), 25, true));
}

#[test]
fn test_can_forge_out_of_range_blocks() {
    let consts = AuctionConsts {
        genesis_block_num: 100,
        blocks_per_slot: 40,
    };
    let current = Slot {
        slot_num: 0,
        start_block: 100,
        end_block: 139,
        forger: forger_addr(),
        forger_commitment: false,
    };
    let next = Slot {
        slot_num: 1,
        start_block: 140,
        end_block: 179,
        ..current
    };
    assert!(!can_forge(&consts, 20, &current, &next, &forger_addr(), 99, true));
    assert!(!can_forge(&consts, 20, &current, &next, &forger_addr(), 180, true));
    assert!(can_forge(&consts, 20, &current, &next, &forger_addr(), 179, true));
}

#[test]
fn test_parse_address() {
    let addr = parse_address("0xaa00000000000000000000000000000000000001").unwrap();
    assert_eq!(addr[0], 0xaa);
    assert_eq!(addr[19], 0x01);
    assert_eq!(parse_address("aa00000000000000000000000000000000000001").unwrap(), addr);
    assert!(parse_address("0xabcd").is_err());
    assert!(parse_address("not hex").is_err());
}
