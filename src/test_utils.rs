use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::chain::{ChainControl, ChainError, SnapshotId};

#[derive(Clone, Default)]
struct FakeState {
    block: u64,
    timestamp: u64,
    pending_time: u64,
    token_balances: HashMap<(Address, Address), U256>,
    native_balances: HashMap<Address, U256>,
}

/// In-memory [`ChainControl`] with Anvil's snapshot semantics: reverting a
/// snapshot consumes it and every snapshot taken after it.
pub(crate) struct FakeChain {
    state: Mutex<FakeState>,
    snapshots: Mutex<Vec<(SnapshotId, FakeState)>>,
    next_snapshot: Mutex<u64>,
    accounts: Vec<Address>,
    impersonated: Mutex<Vec<Address>>,
    refuse_reverts: AtomicBool,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::with_accounts(10)
    }
}

impl FakeChain {
    pub(crate) fn with_accounts(count: u8) -> Self {
        let accounts = (1..=count)
            .map(|byte| Address::repeat_byte(0xa0 ^ byte))
            .collect();

        Self {
            state: Mutex::new(FakeState {
                block: 100,
                timestamp: 1_700_000_000,
                ..FakeState::default()
            }),
            snapshots: Mutex::new(Vec::new()),
            next_snapshot: Mutex::new(1),
            accounts,
            impersonated: Mutex::new(Vec::new()),
            refuse_reverts: AtomicBool::new(false),
        }
    }

    pub(crate) fn block_number(&self) -> u64 {
        self.state.lock().unwrap().block
    }

    pub(crate) fn timestamp(&self) -> u64 {
        self.state.lock().unwrap().timestamp
    }

    pub(crate) fn set_token_balance(&self, token: Address, holder: Address, amount: U256) {
        self.state
            .lock()
            .unwrap()
            .token_balances
            .insert((token, holder), amount);
    }

    pub(crate) fn impersonated(&self) -> Vec<Address> {
        self.impersonated.lock().unwrap().clone()
    }

    pub(crate) fn live_snapshots(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    /// Makes every later revert fail as if the node had lost the snapshot.
    pub(crate) fn refuse_reverts(&self) {
        self.refuse_reverts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainControl for FakeChain {
    async fn advance_time(&self, seconds: u64) -> Result<(), ChainError> {
        self.state.lock().unwrap().pending_time += seconds;
        Ok(())
    }

    async fn mine_blocks(&self, count: u64) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.block += 1;
            state.timestamp += state.pending_time.max(1);
            state.pending_time = 0;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<SnapshotId, ChainError> {
        let mut next = self.next_snapshot.lock().unwrap();
        let id = SnapshotId::new(U256::from(*next));
        *next += 1;

        let state = self.state.lock().unwrap().clone();
        self.snapshots.lock().unwrap().push((id, state));
        Ok(id)
    }

    async fn revert(&self, id: SnapshotId) -> Result<(), ChainError> {
        if self.refuse_reverts.load(Ordering::SeqCst) {
            return Err(ChainError::InvalidSnapshot(id));
        }

        let mut snapshots = self.snapshots.lock().unwrap();
        let Some(position) = snapshots.iter().position(|(taken, _)| *taken == id) else {
            return Err(ChainError::InvalidSnapshot(id));
        };

        let state = snapshots[position].1.clone();
        snapshots.truncate(position);
        *self.state.lock().unwrap() = state;
        Ok(())
    }

    async fn impersonate(&self, address: Address) -> Result<(), ChainError> {
        self.impersonated.lock().unwrap().push(address);
        Ok(())
    }

    async fn set_native_balance(&self, address: Address, amount: U256) -> Result<(), ChainError> {
        self.state
            .lock()
            .unwrap()
            .native_balances
            .insert(address, amount);
        Ok(())
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .native_balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn dev_accounts(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self.accounts.clone())
    }

    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .token_balances
            .get(&(token, holder))
            .copied()
            .unwrap_or_default())
    }
}
