use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Qi = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient qi: required {required}, available {available}")]
    Insufficient { required: Qi, available: Qi },
    #[error("qi balance overflow: {balance} + {amount}")]
    Overflow { balance: Qi, amount: Qi },
}

/// Remove `amount` from a balance. The balance is untouched on failure.
pub fn debit(balance: &mut Qi, amount: Qi) -> Result<(), LedgerError> {
    let next = balance
        .checked_sub(amount)
        .ok_or(LedgerError::Insufficient {
            required: amount,
            available: *balance,
        })?;
    *balance = next;
    Ok(())
}

/// Add `amount` to a balance. The balance is untouched on failure.
pub fn credit(balance: &mut Qi, amount: Qi) -> Result<(), LedgerError> {
    let next = balance.checked_add(amount).ok_or(LedgerError::Overflow {
        balance: *balance,
        amount,
    })?;
    *balance = next;
    Ok(())
}

/// Move Qi between two balances held in different places.
pub fn transfer(from: &mut Qi, to: &mut Qi, amount: Qi) -> Result<(), LedgerError> {
    debit(from, amount)?;
    if let Err(err) = credit(to, amount) {
        // Undo the debit so neither side changes.
        *from += amount;
        return Err(err);
    }
    Ok(())
}

/// Why Qi moved. Flows that cross the boundary of the world total
/// (agents plus ambient pool) are the only ones the audit cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Action cost, agent to recycle reserve. Leaves the world total.
    Spent,
    /// Extracted from an ore node, enters the world total.
    Mined,
    /// Added by the creator from a wallet, enters the world total.
    Infused,
    /// Drawn from a recharge node, enters the world total.
    Recharged,
    /// Dead agent to ambient pool.
    Released,
    /// Dead agent to heir.
    Inherited,
    /// Parent to child on reproduction.
    Endowed,
    /// Recycle reserve back into a recharge node. Both sit outside the world total.
    Recycled,
}

/// Running totals of every ledger movement inside one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QiJournal {
    pub spent: Qi,
    pub mined: Qi,
    pub infused: Qi,
    pub recharged: Qi,
    pub released: Qi,
    pub inherited: Qi,
    pub endowed: Qi,
    #[serde(default)]
    pub recycled: Qi,
}

impl QiJournal {
    pub fn record(&mut self, flow: Flow, amount: Qi) {
        let slot = match flow {
            Flow::Spent => &mut self.spent,
            Flow::Mined => &mut self.mined,
            Flow::Infused => &mut self.infused,
            Flow::Recharged => &mut self.recharged,
            Flow::Released => &mut self.released,
            Flow::Inherited => &mut self.inherited,
            Flow::Endowed => &mut self.endowed,
            Flow::Recycled => &mut self.recycled,
        };
        *slot = slot.saturating_add(amount);
    }

    /// Total the world should hold after this journal, given the total before.
    /// `None` means the journal itself cannot balance (it would go negative or overflow).
    pub fn expected_total(&self, before: Qi) -> Option<Qi> {
        before
            .checked_add(self.mined)?
            .checked_add(self.infused)?
            .checked_add(self.recharged)?
            .checked_sub(self.spent)
    }
}

/// Result of comparing the world total before and after a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QiAudit {
    pub before: Qi,
    pub after: Qi,
    pub journal: QiJournal,
}

impl QiAudit {
    pub fn is_balanced(&self) -> bool {
        self.journal.expected_total(self.before) == Some(self.after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_never_goes_negative() {
        let mut balance: Qi = 2;
        let err = debit(&mut balance, 3).unwrap_err();
        assert_eq!(
            err,
            LedgerError::Insufficient {
                required: 3,
                available: 2
            }
        );
        assert_eq!(balance, 2);
        debit(&mut balance, 2).unwrap();
        assert_eq!(balance, 0);
    }

    #[test]
    fn credit_overflow_leaves_balance() {
        let mut balance = Qi::MAX - 1;
        assert!(credit(&mut balance, 2).is_err());
        assert_eq!(balance, Qi::MAX - 1);
    }

    #[test]
    fn failed_transfer_is_rolled_back() {
        let mut from: Qi = 5;
        let mut to = Qi::MAX;
        assert!(transfer(&mut from, &mut to, 3).is_err());
        assert_eq!(from, 5);
        assert_eq!(to, Qi::MAX);
    }

    #[test]
    fn audit_balances_inflows_and_recycling() {
        let mut journal = QiJournal::default();
        journal.record(Flow::Spent, 5);
        journal.record(Flow::Mined, 3);
        journal.record(Flow::Recharged, 1);
        journal.record(Flow::Released, 4);
        journal.record(Flow::Recycled, 2);
        let audit = QiAudit {
            before: 10,
            after: 9,
            journal,
        };
        assert!(audit.is_balanced());

        let drifted = QiAudit {
            after: 11,
            ..audit
        };
        assert!(!drifted.is_balanced());
    }
}
