//! Stable fingerprints for plans and inline tables.

use blake3::Hasher;
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }

    /// First 16 hex characters; enough to name a vendor reference.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(16);
        hex
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash256 {
    let mut h = Hasher::new();
    h.update(bytes);
    Hash256(h.finalize().into())
}

pub fn hash_str(s: &str) -> Hash256 {
    hash_bytes(s.as_bytes())
}

/// Hash any serde-serializable value deterministically (via JSON).
pub fn hash_serde<T: Serialize>(v: &T) -> Result<Hash256> {
    let bytes = serde_json::to_vec(v).map_err(|e| Error::Plan(e.to_string()))?;
    Ok(hash_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::LogicalPlan;
    use crate::schema::Schema;

    #[test]
    fn equal_plans_hash_equal() {
        let a = LogicalPlan::scan("t", Schema::default());
        let b = LogicalPlan::scan("t", Schema::default());
        let c = LogicalPlan::scan("u", Schema::default());
        assert_eq!(hash_serde(&a).unwrap(), hash_serde(&b).unwrap());
        assert_ne!(hash_serde(&a).unwrap(), hash_serde(&c).unwrap());
        assert_eq!(hash_str("x").to_hex().len(), 64);
        assert_eq!(hash_str("x").short().len(), 16);
    }
}
