//! Permission model.
//!
//! A capability mask is three bits: read (`0b100`), write (`0b010`) and
//! execute (`0b001`). All checks are pure functions over explicit inputs.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

/// 3-bit capability mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Perm(u8);

impl Perm {
    pub const NONE: Perm = Perm(0b000);
    #[doc(alias = "R__")]
    pub const READ: Perm = Perm(0b100);
    #[doc(alias = "_W_")]
    pub const WRITE: Perm = Perm(0b010);
    #[doc(alias = "__X")]
    pub const EXECUTE: Perm = Perm(0b001);
    #[doc(alias = "RW_")]
    pub const READ_WRITE: Perm = Perm(0b110);
    #[doc(alias = "R_X")]
    pub const READ_EXECUTE: Perm = Perm(0b101);
    #[doc(alias = "_WX")]
    pub const WRITE_EXECUTE: Perm = Perm(0b011);
    #[doc(alias = "RWX")]
    pub const ALL: Perm = Perm(0b111);

    /// Returns `None` if any bit above the low three is set.
    pub const fn from_bits(bits: u8) -> Option<Perm> {
        if bits > 0b111 {
            None
        } else {
            Some(Perm(bits))
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns whether every bit of `required` is present.
    pub const fn contains(self, required: Perm) -> bool {
        self.0 & required.0 == required.0
    }

    /// Returns whether any bit of `other` is present.
    pub const fn intersects(self, other: Perm) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Perm {
    type Output = Perm;

    fn bitor(self, rhs: Perm) -> Perm {
        Perm(self.0 | rhs.0)
    }
}

impl TryFrom<u8> for Perm {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Perm::from_bits(bits).ok_or_else(|| format!("permission mask out of range: {}", bits))
    }
}

impl From<Perm> for u8 {
    fn from(perm: Perm) -> u8 {
        perm.0
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Perm::READ) { 'r' } else { '-' };
        let w = if self.contains(Perm::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Perm::EXECUTE) { 'x' } else { '-' };
        write!(f, "{}{}{}", r, w, x)
    }
}

/// Something that carries an owner identity and a granted mask.
pub trait Principal {
    fn owner(&self) -> &str;
    fn perm(&self) -> Perm;
}

/// Checks owner and mask.
///
/// Fails with [`CoreError::Forbidden`] when `expected_owner` is given,
/// non-empty and differs from the principal's owner; otherwise fails with
/// [`CoreError::InsufficientPermission`] unless every required bit is
/// granted.
pub fn verify_access<P: Principal + ?Sized>(
    principal: &P,
    required: Perm,
    expected_owner: Option<&str>,
) -> Result<(), CoreError> {
    if let Some(owner) = expected_owner.filter(|o| !o.is_empty()) {
        if owner != principal.owner() {
            return Err(CoreError::Forbidden);
        }
    }
    if !principal.perm().contains(required) {
        return Err(CoreError::InsufficientPermission);
    }
    Ok(())
}

/// Table-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableOperation {
    Read,
    Write,
    Delete,
}

impl TableOperation {
    /// The bit this operation requires.
    pub fn required(self) -> Perm {
        match self {
            TableOperation::Read => Perm::READ,
            TableOperation::Write => Perm::WRITE,
            TableOperation::Delete => Perm::EXECUTE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TableOperation::Read => "read",
            TableOperation::Write => "write",
            TableOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for TableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn check_table_permission(mask: Perm, operation: TableOperation) -> Result<(), CoreError> {
    if !mask.intersects(operation.required()) {
        return Err(CoreError::TableOperationDenied { operation });
    }
    Ok(())
}

/// Field mask used when a field has no entry in the table.
pub const DEFAULT_FIELD_PERM: Perm = Perm::READ_WRITE;

/// Checks that every field present in `fields` may be written.
///
/// A field whose required mask (default [`DEFAULT_FIELD_PERM`]) includes the
/// write bit needs the write bit in `granted`. Fields absent from `fields`
/// are not checked, so partial updates may omit fields the caller cannot
/// write.
pub fn check_field_permissions(
    fields: &Map<String, Value>,
    field_perms: &HashMap<String, Perm>,
    granted: Perm,
) -> Result<(), CoreError> {
    for field in fields.keys() {
        let required = field_perms
            .get(field)
            .copied()
            .unwrap_or(DEFAULT_FIELD_PERM);
        if required.contains(Perm::WRITE) && !granted.contains(Perm::WRITE) {
            return Err(CoreError::FieldReadOnly {
                field: field.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    struct Ctx {
        owner: String,
        perm: Perm,
    }

    impl Principal for Ctx {
        fn owner(&self) -> &str {
            &self.owner
        }
        fn perm(&self) -> Perm {
            self.perm
        }
    }

    fn ctx(owner: &str, bits: u8) -> Ctx {
        Ctx {
            owner: owner.to_string(),
            perm: Perm::from_bits(bits).unwrap(),
        }
    }

    #[test]
    fn test_named_unions() {
        assert_eq!(Perm::READ | Perm::WRITE, Perm::READ_WRITE);
        assert_eq!(Perm::READ | Perm::EXECUTE, Perm::READ_EXECUTE);
        assert_eq!(Perm::WRITE | Perm::EXECUTE, Perm::WRITE_EXECUTE);
        assert_eq!(Perm::READ | Perm::WRITE | Perm::EXECUTE, Perm::ALL);
        assert_eq!(Perm::ALL.bits(), 7);
        assert_eq!(Perm::READ_WRITE.to_string(), "rw-");
        assert_eq!(Perm::NONE.to_string(), "---");
    }

    #[test]
    fn test_from_bits_range() {
        assert_eq!(Perm::from_bits(5), Some(Perm::READ_EXECUTE));
        assert_eq!(Perm::from_bits(8), None);

        let parsed: Perm = serde_json::from_str("6").unwrap();
        assert_eq!(parsed, Perm::READ_WRITE);
        assert!(serde_json::from_str::<Perm>("9").is_err());
        assert_eq!(serde_json::to_string(&Perm::ALL).unwrap(), "7");
    }

    #[test]
    fn test_verify_access_examples() {
        let c = ctx("alice", 0b110);
        assert!(verify_access(&c, Perm::READ, Some("alice")).is_ok());
        assert!(matches!(
            verify_access(&c, Perm::EXECUTE, Some("alice")),
            Err(CoreError::InsufficientPermission)
        ));
        assert!(matches!(
            verify_access(&c, Perm::READ, Some("bob")),
            Err(CoreError::Forbidden)
        ));
        // No expected owner: only the mask matters
        assert!(verify_access(&c, Perm::READ_WRITE, None).is_ok());
        assert!(verify_access(&c, Perm::READ, Some("")).is_ok());
    }

    #[test]
    fn test_owner_checked_before_mask() {
        let c = ctx("alice", 0);
        assert!(matches!(
            verify_access(&c, Perm::ALL, Some("bob")),
            Err(CoreError::Forbidden)
        ));
    }

    #[test]
    fn test_table_permission() {
        assert!(check_table_permission(Perm::READ, TableOperation::Read).is_ok());
        assert!(check_table_permission(Perm::WRITE, TableOperation::Write).is_ok());
        assert!(check_table_permission(Perm::EXECUTE, TableOperation::Delete).is_ok());

        let err = check_table_permission(Perm::READ_WRITE, TableOperation::Delete).unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete");
        let err = check_table_permission(Perm::READ, TableOperation::Write).unwrap_err();
        assert_eq!(err.to_string(), "Cannot write");
    }

    #[test]
    fn test_field_permissions() {
        let mut table = HashMap::new();
        table.insert("id".to_string(), Perm::READ);
        table.insert("email".to_string(), Perm::READ_WRITE);

        let read_only = Perm::READ;

        // Only a read-only field present: allowed
        let data = json!({"id": 1});
        assert!(check_field_permissions(data.as_object().unwrap(), &table, read_only).is_ok());

        // Writable field present without write bit: denied, naming the field
        let data = json!({"email": "a@b.c"});
        let err =
            check_field_permissions(data.as_object().unwrap(), &table, read_only).unwrap_err();
        assert!(matches!(err, CoreError::FieldReadOnly { ref field } if field == "email"));

        // Unlisted field defaults to read+write
        let data = json!({"nickname": "z"});
        assert!(check_field_permissions(data.as_object().unwrap(), &table, read_only).is_err());
        assert!(check_field_permissions(data.as_object().unwrap(), &table, Perm::WRITE).is_ok());

        // Empty update touches nothing
        let data = json!({});
        assert!(check_field_permissions(data.as_object().unwrap(), &table, Perm::NONE).is_ok());
    }

    proptest! {
        #[test]
        fn prop_verify_access_matches_bit_math(granted in 0u8..8, required in 0u8..8, same_owner in any::<bool>()) {
            let c = ctx("alice", granted);
            let expected = if same_owner { "alice" } else { "mallory" };
            let result = verify_access(&c, Perm::from_bits(required).unwrap(), Some(expected));
            let should_pass = same_owner && (granted & required) == required;
            prop_assert_eq!(result.is_ok(), should_pass);
        }
    }
}
