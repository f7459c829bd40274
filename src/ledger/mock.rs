//! In-memory [`Ledger`] for tests.
//!
//! Keeps per-bin balances so a withdraw followed by a deposit moves
//! liquidity the way the chain would, tracks call counts and captures
//! the last request of each write.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloy::primitives::{Address, B256, U256, address};
use async_trait::async_trait;

use super::{
    DepositReceipt, DepositRequest, GasCost, Ledger, LedgerError, PairInfo, WithdrawReceipt,
    WithdrawRequest,
};
use moe_evm::EvmError;

pub(crate) const MOCK_OWNER: Address = address!("0x6c6402c6b99771cfc7acc398f566c19ba051ac8e");
pub(crate) const MOCK_WITHDRAW_TX: B256 = B256::repeat_byte(0x11);
pub(crate) const MOCK_DEPOSIT_TX: B256 = B256::repeat_byte(0x22);

pub(crate) struct MockLedger {
    pair: Mutex<PairInfo>,
    balances: Mutex<BTreeMap<u32, U256>>,
    withdrawn_amounts: (U256, U256),
    withdraw_count: AtomicUsize,
    deposit_count: AtomicUsize,
    fail_reads: AtomicBool,
    fail_withdraw: AtomicBool,
    unmeasured_withdraw: AtomicBool,
    fail_deposit: AtomicBool,
    last_withdraw: Mutex<Option<WithdrawRequest>>,
    last_deposit: Mutex<Option<DepositRequest>>,
}

impl MockLedger {
    /// Creates a mock ledger with an empty position around bin 2^23.
    pub(crate) fn new() -> Self {
        Self {
            pair: Mutex::new(PairInfo {
                active_bin_id: 8_388_608,
                bin_step: 1,
                token_x: address!("0x09bc4e0d864854c6afb6eb9a9cdf58ac190d0df9"),
                token_y: address!("0x201eba5cc46d216ce6dc03f6a759e8e766e956ae"),
                decimals_x: 6,
                decimals_y: 6,
            }),
            balances: Mutex::new(BTreeMap::new()),
            withdrawn_amounts: (U256::from(1_000_000_u64), U256::from(2_000_000_u64)),
            withdraw_count: AtomicUsize::new(0),
            deposit_count: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_withdraw: AtomicBool::new(false),
            unmeasured_withdraw: AtomicBool::new(false),
            fail_deposit: AtomicBool::new(false),
            last_withdraw: Mutex::new(None),
            last_deposit: Mutex::new(None),
        }
    }

    pub(crate) fn failing_withdraw() -> Self {
        let ledger = Self::new();
        ledger.fail_withdraw.store(true, Ordering::SeqCst);
        ledger
    }

    /// Withdraw lands but the token balances cannot be read afterwards.
    pub(crate) fn unmeasured_withdraw() -> Self {
        let ledger = Self::new();
        ledger.unmeasured_withdraw.store(true, Ordering::SeqCst);
        ledger
    }

    pub(crate) fn failing_deposit() -> Self {
        let ledger = Self::new();
        ledger.fail_deposit.store(true, Ordering::SeqCst);
        ledger
    }

    pub(crate) fn with_balance(self, bin_id: u32, balance: U256) -> Self {
        self.balances.lock().unwrap().insert(bin_id, balance);
        self
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn balance_of(&self, bin_id: u32) -> U256 {
        self.balances
            .lock()
            .unwrap()
            .get(&bin_id)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn withdraw_calls(&self) -> usize {
        self.withdraw_count.load(Ordering::SeqCst)
    }

    pub(crate) fn deposit_calls(&self) -> usize {
        self.deposit_count.load(Ordering::SeqCst)
    }

    pub(crate) fn last_withdraw(&self) -> Option<WithdrawRequest> {
        self.last_withdraw.lock().unwrap().clone()
    }

    pub(crate) fn last_deposit(&self) -> Option<DepositRequest> {
        self.last_deposit.lock().unwrap().clone()
    }

    fn mock_failure(message: &str) -> LedgerError {
        LedgerError::Evm(EvmError::Transport(
            alloy::transports::TransportErrorKind::custom_str(message),
        ))
    }
}

#[async_trait]
impl Ledger for MockLedger {
    fn owner(&self) -> Address {
        MOCK_OWNER
    }

    async fn pair_info(&self) -> Result<PairInfo, LedgerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::mock_failure("mock pair_info failure"));
        }

        Ok(*self.pair.lock().unwrap())
    }

    async fn balances(&self, _owner: Address, bin_ids: &[u32]) -> Result<Vec<U256>, LedgerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::mock_failure("mock balances failure"));
        }

        Ok(bin_ids.iter().map(|id| self.balance_of(*id)).collect())
    }

    async fn withdraw(&self, request: &WithdrawRequest) -> Result<WithdrawReceipt, LedgerError> {
        self.withdraw_count.fetch_add(1, Ordering::SeqCst);
        *self.last_withdraw.lock().unwrap() = Some(request.clone());

        if self.fail_withdraw.load(Ordering::SeqCst) {
            return Err(Self::mock_failure("mock withdraw failure"));
        }

        {
            let mut balances = self.balances.lock().unwrap();
            for bin_id in &request.bin_ids {
                balances.remove(bin_id);
            }
        }

        if self.unmeasured_withdraw.load(Ordering::SeqCst) {
            return Err(LedgerError::WithdrawUnmeasured {
                tx_hash: MOCK_WITHDRAW_TX,
                source: Box::new(Self::mock_failure("mock balanceOf failure")),
            });
        }

        Ok(WithdrawReceipt {
            tx_hash: MOCK_WITHDRAW_TX,
            amount_x: self.withdrawn_amounts.0,
            amount_y: self.withdrawn_amounts.1,
            gas: GasCost {
                gas_used: 120_000,
                cost_wei: 2_400_000_000_000,
            },
        })
    }

    async fn deposit(&self, request: &DepositRequest) -> Result<DepositReceipt, LedgerError> {
        self.deposit_count.fetch_add(1, Ordering::SeqCst);
        *self.last_deposit.lock().unwrap() = Some(request.clone());

        if self.fail_deposit.load(Ordering::SeqCst) {
            return Err(Self::mock_failure("mock deposit failure"));
        }

        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry(request.target_bin_id).or_default();
        *balance = balance.saturating_add(request.amount_x.saturating_add(request.amount_y));

        Ok(DepositReceipt {
            tx_hash: MOCK_DEPOSIT_TX,
            gas: GasCost {
                gas_used: 180_000,
                cost_wei: 3_600_000_000_000,
            },
        })
    }
}
