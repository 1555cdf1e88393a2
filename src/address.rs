use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

/// Wallet-derived mining address. `index == -1` denotes a dev-fee address
///; everything else is a normal registered wallet address.
#[derive(Debug, Clone)]
pub struct Address {
    pub index: i64,
    pub bech32: String,
    pub public_key: String,
    registered: Arc<AtomicBool>,
}

impl Address {
    pub fn new(index: i64, bech32: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            index,
            bech32: bech32.into(),
            public_key: public_key.into(),
            registered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dev_fee(bech32: impl Into<String>) -> Self {
        Self {
            index: -1,
            bech32: bech32.into(),
            public_key: String::new(),
            registered: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_dev_fee(&self) -> bool {
        self.index < 0
    }

    pub fn registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn mark_registered(&self) {
        self.registered.store(true, Ordering::Relaxed);
    }
}

/// Produces the signature needed to register an address with the service.
/// Wallet key derivation and signing are deliberately out of scope here —
/// this trait is the seam a real signer plugs into; callers in this
/// crate only need the resulting hex signature.
pub trait AddressSigner: Send + Sync {
    fn sign_registration(&self, address: &Address) -> Result<String>;
}

/// A signer that always fails, useful as the default when no real signer
/// has been wired up (e.g. a dry-run or a test harness that never expects
/// registration to actually occur).
pub struct UnimplementedSigner;

impl AddressSigner for UnimplementedSigner {
    fn sign_registration(&self, address: &Address) -> Result<String> {
        anyhow::bail!(
            "no AddressSigner configured; cannot sign registration for {}",
            address.bech32
        )
    }
}

/// Owns the set of addresses this process mines with. Exclusively owned by
/// the wallet layer; the orchestrator only reads from it.
pub struct WalletManager {
    addresses: Vec<Address>,
    signer: Arc<dyn AddressSigner>,
}

impl WalletManager {
    pub fn new(addresses: Vec<Address>, signer: Arc<dyn AddressSigner>) -> Self {
        Self { addresses, signer }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn unregistered(&self) -> impl Iterator<Item = &Address> {
        self.addresses.iter().filter(|a| !a.registered())
    }

    pub fn find(&self, bech32: &str) -> Option<&Address> {
        self.addresses.iter().find(|a| a.bech32 == bech32)
    }

    pub fn sign_registration(&self, address: &Address) -> Result<String> {
        self.signer.sign_registration(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_fee_address_has_negative_index() {
        let addr = Address::dev_fee("mn1devfeeaddress");
        assert!(addr.is_dev_fee());
        assert!(addr.registered());
    }

    #[test]
    fn fresh_address_starts_unregistered() {
        let addr = Address::new(0, "mn1abc", "pubkeyhex");
        assert!(!addr.registered());
        addr.mark_registered();
        assert!(addr.registered());
    }

    #[test]
    fn wallet_manager_filters_unregistered() {
        let a = Address::new(0, "mn1a", "pk0");
        let b = Address::new(1, "mn1b", "pk1");
        b.mark_registered();
        let wallet = WalletManager::new(vec![a, b], Arc::new(UnimplementedSigner));
        let unregistered: Vec<_> = wallet.unregistered().map(|a| a.bech32.clone()).collect();
        assert_eq!(unregistered, vec!["mn1a".to_string()]);
    }
}
