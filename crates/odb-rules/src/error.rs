use std::fmt;

use odb_crypto::CryptoError;
use odb_store::StoreError;
use odb_types::TypeError;

use crate::expr::ExprError;

/// Closed taxonomy of rule violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BlockPrevHash,
    BlockPrevId,
    BlockEmpty,
    BlockMerkleTreeFailed,
    BlockSigMerkleTreeFailed,
    BlockHashFailed,
    BlockSignatureFailed,
    BlockHashIsDuplicated,
    BlockSizeIsExceeded,

    OpSizeIsExceeded,
    OpHashIsDuplicated,
    OpHashIsNotCorrect,
    OpEmpty,
    OpSignatureFailed,
    LimitOfCreatedObjForOpWasExceeded,

    NewObjDoubleCreated,
    DelObjNotFound,
    DelObjDoubleDeleted,
    ObjModifiedTwiceInSameOperation,
    EditObjNotFound,
    EditOldFieldValueIncorrect,
    EditChangeDidNotSpecifyCurrentValue,
    EditOpNotSupported,
    EditOpIncrementOnlyForNumbers,
    EditOpAppendOnlyForListMap,
    RefObjNotFound,

    VoteVotingObjIsFinal,
    VoteOpSupportOnlySysVoteType,
    VoteOpIsNotSame,

    OpValidationFailed,
    OpInvalidValidateExpression,
    OpRoleSuperRoleDoesntExist,
    OpRoleSuperRoleCircularRef,
    OpGrantRoleDoesntExist,

    MgmtCantDeleteNonLastOperations,
    MgmtReplicationIoFailed,
    MgmtReplicationBlockDownloadFailed,
    MgmtReplicationBlockConflicts,
}

impl ErrorKind {
    /// Upper snake case name, stable across releases.
    pub fn code(&self) -> &'static str {
        self.describe().0
    }

    /// Message template. `%s` and `%d` are filled positionally.
    pub fn template(&self) -> &'static str {
        self.describe().1
    }

    fn describe(&self) -> (&'static str, &'static str) {
        use ErrorKind::*;
        match self {
            BlockPrevHash => (
                "BLOCK_PREV_HASH",
                "Previous block hash is not equal '%s' != '%s': block '%s'",
            ),
            BlockPrevId => (
                "BLOCK_PREV_ID",
                "Previous block id is not equal '%d' != '%d': block '%s'",
            ),
            BlockEmpty => ("BLOCK_EMPTY", "Block '%s' doesn't have any operations"),
            BlockMerkleTreeFailed => (
                "BLOCK_MERKLE_TREE_FAILED",
                "Block '%s': failed to validate merkle tree '%s' != '%s'",
            ),
            BlockSigMerkleTreeFailed => (
                "BLOCK_SIG_MERKLE_TREE_FAILED",
                "Block '%s': failed to validate signature merkle tree '%s' != '%s'",
            ),
            BlockHashFailed => ("BLOCK_HASH_FAILED", "Block '%s': failed to validate hash '%s'"),
            BlockSignatureFailed => (
                "BLOCK_SIGNATURE_FAILED",
                "Block '%s': signature of '%s' failed to validate",
            ),
            BlockHashIsDuplicated => (
                "BLOCK_HASH_IS_DUPLICATED",
                "Block hash is duplicated '%s' in block '%d' and '%d'",
            ),
            BlockSizeIsExceeded => (
                "BLOCK_SIZE_IS_EXCEEDED",
                "Block '%s' size '%d' exceeds the limit '%d'",
            ),
            OpSizeIsExceeded => (
                "OP_SIZE_IS_EXCEEDED",
                "Operation '%s' size '%d' exceeds the limit '%d'",
            ),
            OpHashIsDuplicated => (
                "OP_HASH_IS_DUPLICATED",
                "Operation '%s' hash is duplicated in block '%s'",
            ),
            OpHashIsNotCorrect => (
                "OP_HASH_IS_NOT_CORRECT",
                "Operation hash is not correct '%s' != '%s'",
            ),
            OpEmpty => ("OP_EMPTY", "Empty operation '%s' is not allowed in block %s"),
            OpSignatureFailed => (
                "OP_SIGNATURE_FAILED",
                "Operation '%s': signed by '%s' could not be validated",
            ),
            LimitOfCreatedObjForOpWasExceeded => (
                "LIMIT_OF_CREATED_OBJ_FOR_OP_WAS_EXCEEDED",
                "Operation '%s': exceeded amount of created objects",
            ),
            NewObjDoubleCreated => (
                "NEW_OBJ_DOUBLE_CREATED",
                "Operation '%s': object '%s' was already created",
            ),
            DelObjNotFound => (
                "DEL_OBJ_NOT_FOUND",
                "Operation '%s': object to delete '%s' wasn't found",
            ),
            DelObjDoubleDeleted => (
                "DEL_OBJ_DOUBLE_DELETED",
                "Operation '%s': object '%s' was already deleted",
            ),
            ObjModifiedTwiceInSameOperation => (
                "OBJ_MODIFIED_TWICE_IN_SAME_OPERATION",
                "Operation '%s': object '%s' was modified twice in the same operation",
            ),
            EditObjNotFound => (
                "EDIT_OBJ_NOT_FOUND",
                "Operation '%s': object to edit '%s' wasn't found",
            ),
            EditOldFieldValueIncorrect => (
                "EDIT_OLD_FIELD_VALUE_INCORRECT",
                "Operation '%s': object '%s' old field '%s' value '%s' expected old field value '%s'",
            ),
            EditChangeDidNotSpecifyCurrentValue => (
                "EDIT_CHANGE_DID_NOT_SPECIFY_CURRENT_VALUE",
                "Operation '%s': change field '%s' is missing in current section of edit operation (optimistic lock) - object '%s'",
            ),
            EditOpNotSupported => (
                "EDIT_OP_NOT_SUPPORTED",
                "Edit obj operation '%s' is not supported yet",
            ),
            EditOpIncrementOnlyForNumbers => (
                "EDIT_OP_INCREMENT_ONLY_FOR_NUMBERS",
                "Operation increment only supported for numbers: field '%s', value '%s'",
            ),
            EditOpAppendOnlyForListMap => (
                "EDIT_OP_APPEND_ONLY_FOR_LIST_MAP",
                "Operation append only supported for list and map: field '%s', value '%s'",
            ),
            RefObjNotFound => (
                "REF_OBJ_NOT_FOUND",
                "Operation '%s': object to reference wasn't found '%s'",
            ),
            VoteVotingObjIsFinal => (
                "VOTE_VOTING_OBJ_IS_FINAL",
                "Operation '%s': ref obj '%s' is already final and cannot to be a changed",
            ),
            VoteOpSupportOnlySysVoteType => (
                "VOTE_OP_SUPPORT_ONLY_SYS_VOTE_TYPE",
                "Operation '%s': ref obj type '%s'",
            ),
            VoteOpIsNotSame => (
                "VOTE_OP_IS_NOT_SAME",
                "Operation '%s': vote edit obj: '%s' is not equal current obj edit: '%s'",
            ),
            OpValidationFailed => (
                "OP_VALIDATION_FAILED",
                "Operation '%s': failed validation rule '%s'. %s",
            ),
            OpInvalidValidateExpression => (
                "OP_INVALID_VALIDATE_EXPRESSION",
                "Operation '%s': validate expression couldn't be parsed. %s",
            ),
            OpRoleSuperRoleDoesntExist => (
                "OP_ROLE_SUPER_ROLE_DOESNT_EXIST",
                "Operation '%s': super role '%s' defined for '%s' is not defined",
            ),
            OpRoleSuperRoleCircularRef => (
                "OP_ROLE_SUPER_ROLE_CIRCULAR_REF",
                "Operation '%s': super role '%s' defined for '%s' has circular references",
            ),
            OpGrantRoleDoesntExist => (
                "OP_GRANT_ROLE_DOESNT_EXIST",
                "Operation '%s': role '%s' which is granted to '%s' doesn't exist",
            ),
            MgmtCantDeleteNonLastOperations => (
                "MGMT_CANT_DELETE_NON_LAST_OPERATIONS",
                "Operation '%s' couldn't be validated cause the parent operation '%s' is going to be deleted",
            ),
            MgmtReplicationIoFailed => ("MGMT_REPLICATION_IO_FAILED", "Replication sync has failed"),
            MgmtReplicationBlockDownloadFailed => (
                "MGMT_REPLICATION_BLOCK_DOWNLOAD_FAILED",
                "Replication: replication of '%s' block has failed",
            ),
            MgmtReplicationBlockConflicts => (
                "MGMT_REPLICATION_BLOCK_CONFLICTS",
                "Replication: replication has conflicting blocks '%s'-there vs '%s'-here: '%s'",
            ),
        }
    }

    /// Fill the template with `args` in order. Missing arguments render
    /// as `null`; extra arguments are ignored.
    pub fn format(&self, args: &[&dyn fmt::Display]) -> String {
        let template = self.template();
        let mut out = String::with_capacity(template.len() + 32);
        let mut args = args.iter();
        let mut rest = template;
        while let Some(pos) = rest.find('%') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if tail.starts_with("%s") || tail.starts_with("%d") {
                match args.next() {
                    Some(a) => out.push_str(&a.to_string()),
                    None => out.push_str("null"),
                }
                rest = &tail[2..];
            } else {
                out.push('%');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A rule violation: the kind plus the rendered message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: ErrorKind, args: &[&dyn fmt::Display]) -> Self {
        Self {
            kind,
            message: kind.format(args),
        }
    }
}

/// Errors raised by the rules engine.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    /// An operation or block broke a consensus rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The chain's persistence collaborator failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("object model error: {0}")]
    Types(#[from] TypeError),

    /// A stored rule expression could not be compiled.
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),
}

impl RulesError {
    /// Kind of the violated rule, if this is a validation failure.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Validation(v) => Some(v.kind),
            _ => None,
        }
    }
}

/// Render an id list the way error messages show it: `[a, b]`.
pub fn id_string<S: AsRef<str>>(id: &[S]) -> String {
    let parts: Vec<&str> = id.iter().map(AsRef::as_ref).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_positional_arguments() {
        let e = ValidationError::new(ErrorKind::BlockPrevId, &[&4, &6, &"abc"]);
        assert_eq!(e.message, "Previous block id is not equal '4' != '6': block 'abc'");
        assert_eq!(e.kind.code(), "BLOCK_PREV_ID");
    }

    #[test]
    fn missing_arguments_render_null() {
        let e = ValidationError::new(ErrorKind::OpHashIsDuplicated, &[&"h"]);
        assert_eq!(e.message, "Operation 'h' hash is duplicated in block 'null'");
    }

    #[test]
    fn rules_error_exposes_kind() {
        let err: RulesError = ValidationError::new(ErrorKind::BlockEmpty, &[&"x"]).into();
        assert_eq!(err.kind(), Some(ErrorKind::BlockEmpty));
        assert_eq!(err.to_string(), "Block 'x' doesn't have any operations");
        let err: RulesError = StoreError::LockPoisoned.into();
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn id_lists_render_like_lists() {
        assert_eq!(id_string(&["a", "b"]), "[a, b]");
        assert_eq!(id_string::<&str>(&[]), "[]");
    }
}
