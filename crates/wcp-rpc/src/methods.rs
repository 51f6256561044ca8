//! Wire method constants.
//!
//! The pairing and session families are parallel except that only sessions
//! carry notifications and permission upgrades. The generic sequence engine
//! selects one [`MethodTable`] per sequence kind.

pub mod pairing {
    pub const PROPOSE: &str = "wc_pairingPropose";
    pub const APPROVE: &str = "wc_pairingApprove";
    pub const REJECT: &str = "wc_pairingReject";
    pub const UPDATE: &str = "wc_pairingUpdate";
    pub const DELETE: &str = "wc_pairingDelete";
    pub const PING: &str = "wc_pairingPing";
    pub const PAYLOAD: &str = "wc_pairingPayload";
}

pub mod session {
    pub const PROPOSE: &str = "wc_sessionPropose";
    pub const APPROVE: &str = "wc_sessionApprove";
    pub const REJECT: &str = "wc_sessionReject";
    pub const UPDATE: &str = "wc_sessionUpdate";
    pub const UPGRADE: &str = "wc_sessionUpgrade";
    pub const DELETE: &str = "wc_sessionDelete";
    pub const PING: &str = "wc_sessionPing";
    pub const PAYLOAD: &str = "wc_sessionPayload";
    pub const NOTIFICATION: &str = "wc_sessionNotification";
}

/// The JSON-RPC method names of one sequence family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodTable {
    pub propose: &'static str,
    pub approve: &'static str,
    pub reject: &'static str,
    pub update: &'static str,
    pub upgrade: Option<&'static str>,
    pub delete: &'static str,
    pub ping: &'static str,
    pub payload: &'static str,
    pub notification: Option<&'static str>,
}

pub const PAIRING: MethodTable = MethodTable {
    propose: pairing::PROPOSE,
    approve: pairing::APPROVE,
    reject: pairing::REJECT,
    update: pairing::UPDATE,
    upgrade: None,
    delete: pairing::DELETE,
    ping: pairing::PING,
    payload: pairing::PAYLOAD,
    notification: None,
};

pub const SESSION: MethodTable = MethodTable {
    propose: session::PROPOSE,
    approve: session::APPROVE,
    reject: session::REJECT,
    update: session::UPDATE,
    upgrade: Some(session::UPGRADE),
    delete: session::DELETE,
    ping: session::PING,
    payload: session::PAYLOAD,
    notification: Some(session::NOTIFICATION),
};

impl MethodTable {
    /// True when `method` is one of this family's control methods, i.e. a
    /// message the sequence engine itself consumes.
    pub fn is_control(&self, method: &str) -> bool {
        method == self.propose
            || method == self.approve
            || method == self.reject
            || method == self.update
            || self.upgrade == Some(method)
            || method == self.delete
            || method == self.ping
            || method == self.payload
            || self.notification == Some(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_are_parallel() {
        assert!(PAIRING.is_control("wc_pairingDelete"));
        assert!(SESSION.is_control("wc_sessionDelete"));
        assert!(SESSION.is_control("wc_sessionUpgrade"));
        assert!(!PAIRING.is_control("wc_sessionDelete"));
        assert!(!PAIRING.is_control("wc_pairingUpgrade"));
        assert!(!SESSION.is_control("eth_sign"));
    }
}
