use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use odb_crypto::signer::ALGO_EC;
use odb_crypto::{
    decode_signature, hash_bytes, ContentHasher, CryptoError, KeyPair, MerkleTree, SignatureAlgo,
    VerifyingKey,
};
use odb_store::StoreResult;
use odb_types::block::{
    F_BLOCK_ID, F_DETAILS, F_EXTRA, F_HASH as F_BLOCK_HASH, F_MERKLE_TREE_HASH, F_PREV_BLOCK_HASH,
    F_SIGNATURE as F_BLOCK_SIGNATURE, F_SIGNED_BY as F_BLOCK_SIGNED_BY, F_SIG_MERKLE_TREE_HASH,
    F_VERSION,
};
use odb_types::json::{canonical_json, string_array};
use odb_types::operation::{F_HASH, F_SIGNATURE};
use odb_types::{Block, CompoundKey, OpObject, Operation};

use crate::config::RulesConfig;
use crate::ctx::LocalValidationCtx;
use crate::error::{id_string, ErrorKind, RulesError, ValidationError};
use crate::expr::{EvalContext, Expr, ExprError, SignerRoles};
use crate::listener::{TracingListener, ValidationListener};
use crate::names::*;
use crate::roles::{RoleClosure, F_SUPER_ROLES};
use crate::view::{ChainView, ObjectsSearchRequest};

const BLOCK_EXTRA: i64 = 0;
const BLOCK_CREATION_DETAILS: &str = "";

/// Rule whose stored expression reads a field that never existed; it is
/// evaluated against `owner_role` instead.
const LEGACY_ROLE_RULE: &str = "sys_validate_check_previous_role_for_change";
const LEGACY_ROLE_EXPR: &str = "auth:has_sig_roles(this, .old.0.role)";
const LEGACY_ROLE_FIX: &str = "auth:has_sig_roles(this, .old.0.owner_role)";

/// A `sys.validate` object with its expressions parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub id: Vec<String>,
    pub error_message: String,
    pub ifs: Vec<Expr>,
    pub validates: Vec<Expr>,
}

impl CompiledRule {
    pub fn compile(rule: &OpObject) -> Result<Self, ExprError> {
        let id = rule.id();
        let parse_all = |field: &str| -> Result<Vec<Expr>, ExprError> {
            rule.get_string_list(field)
                .iter()
                .map(|e| Expr::parse(legacy_fix(&id, e)))
                .collect()
        };
        Ok(Self {
            ifs: parse_all(F_IF)?,
            validates: parse_all(F_VALIDATE)?,
            error_message: rule.get_str(F_ERROR_MESSAGE).unwrap_or("").to_string(),
            id,
        })
    }
}

fn legacy_fix<'a>(id: &[String], expr: &'a str) -> &'a str {
    if id.first().map(String::as_str) == Some(LEGACY_ROLE_RULE) && expr == LEGACY_ROLE_EXPR {
        LEGACY_ROLE_FIX
    } else {
        expr
    }
}

/// Compiled validation rules grouped by the operation type they apply to.
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    by_type: BTreeMap<String, Vec<Arc<CompiledRule>>>,
}

impl ValidationRules {
    pub fn from_objects<'a>(
        rules: impl IntoIterator<Item = &'a OpObject>,
    ) -> Result<Self, ExprError> {
        let mut by_type: BTreeMap<String, Vec<Arc<CompiledRule>>> = BTreeMap::new();
        for obj in rules {
            let compiled = Arc::new(CompiledRule::compile(obj)?);
            for t in obj.get_string_list(F_TYPE) {
                by_type.entry(t).or_default().push(compiled.clone());
            }
        }
        Ok(Self { by_type })
    }

    pub fn for_type(&self, op_type: &str) -> &[Arc<CompiledRule>] {
        self.by_type.get(op_type).map_or(&[], Vec::as_slice)
    }
}

/// The consensus rules of the database.
///
/// Stateless apart from its configuration: role closures and compiled
/// validation rules are cached on the chain through
/// [`ChainView::set_cache_after_search`]. Every violation is reported to the
/// [`ValidationListener`] and then returned as [`RulesError::Validation`].
pub struct OpBlockchainRules {
    config: RulesConfig,
    listener: Arc<dyn ValidationListener>,
}

impl Default for OpBlockchainRules {
    fn default() -> Self {
        Self::new(RulesConfig::default())
    }
}

impl fmt::Debug for OpBlockchainRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpBlockchainRules")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OpBlockchainRules {
    pub fn new(config: RulesConfig) -> Self {
        Self::with_listener(config, Arc::new(TracingListener))
    }

    pub fn with_listener(config: RulesConfig, listener: Arc<dyn ValidationListener>) -> Self {
        Self { config, listener }
    }

    pub fn config(&self) -> &RulesConfig {
        &self.config
    }

    /// Report a violation to the listener and wrap it as an error.
    pub fn error(&self, subject: &str, kind: ErrorKind, args: &[&dyn fmt::Display]) -> RulesError {
        let err = ValidationError::new(kind, args);
        self.listener.on_error(subject, &err);
        RulesError::Validation(err)
    }

    // ---- hashing and signing ----

    /// `json:sha256:<hex>` over the canonical JSON of the operation
    /// without its hash and signatures.
    pub fn calculate_operation_hash(&self, op: &Operation) -> String {
        let json = canonical_json(&op.to_value(true));
        format!(
            "{JSON_MSG_TYPE}:{}",
            ContentHasher::SHA256.hash_formatted(json.as_bytes())
        )
    }

    /// Hash the operation and sign the hash with every key pair. One
    /// signature is stored as a string, several as a list.
    pub fn generate_hash_and_sign(
        &self,
        op: &mut Operation,
        keys: &[&KeyPair],
    ) -> Result<String, RulesError> {
        let hash = self.calculate_operation_hash(op);
        op.put(F_HASH, Value::String(hash.clone()))?;
        let msg = hash_bytes(&hash)?;
        op.remove(F_SIGNATURE)?;
        let mut sigs = keys
            .iter()
            .map(|k| k.sign(&msg, SignatureAlgo::Ecdsa))
            .collect::<Result<Vec<_>, _>>()?;
        match sigs.len() {
            0 => {}
            1 => op.put(F_SIGNATURE, Value::String(sigs.remove(0)))?,
            _ => op.put(F_SIGNATURE, string_array(sigs.as_slice()))?,
        }
        Ok(hash)
    }

    /// Merkle root over the hash bytes of every operation.
    pub fn calculate_merkle_tree_hash(&self, block: &Block) -> Result<String, RulesError> {
        let leaves = block
            .operations()
            .iter()
            .map(|o| hash_bytes(o.hash().unwrap_or("")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MerkleTree::from_leaves(leaves).root_hash())
    }

    /// Merkle root over the concatenated signature bytes of every operation.
    pub fn calculate_sig_merkle_tree_hash(&self, block: &Block) -> Result<String, RulesError> {
        let mut leaves = Vec::with_capacity(block.operations().len());
        for op in block.operations() {
            let mut bytes = Vec::new();
            for sig in op.signatures() {
                bytes.extend(decode_signature(&sig)?);
            }
            leaves.push(bytes);
        }
        Ok(MerkleTree::from_leaves(leaves).root_hash())
    }

    /// Block hash over the big-endian binary form of the header fields.
    pub fn calculate_block_hash(&self, block: &Block) -> Result<String, RulesError> {
        let version = block.get_i64(F_VERSION).unwrap_or(self.config.block_version);
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&(version as i32).to_be_bytes());
        buf.extend_from_slice(&(block.block_id() as i32).to_be_bytes());
        buf.extend(hash_bytes(block.prev_block_hash())?);
        buf.extend_from_slice(&block.date_millis().to_be_bytes());
        buf.extend(hash_bytes(block.merkle_tree_hash())?);
        buf.extend(hash_bytes(block.sig_merkle_tree_hash())?);
        buf.extend_from_slice(&block.extra().to_be_bytes());
        let details = block.details().as_bytes();
        if !details.is_empty() {
            buf.extend_from_slice(details);
            buf.extend_from_slice(details);
        }
        Ok(ContentHasher::SHA256.hash_formatted(&buf))
    }

    /// Canonical JSON length of the block, failing above the configured
    /// limit.
    pub fn calculate_block_size(&self, block: &Block) -> Result<usize, RulesError> {
        let size = canonical_json(&block.to_value()).len();
        if size > self.config.max_block_size {
            return Err(self.error(
                block.full_hash(),
                ErrorKind::BlockSizeIsExceeded,
                &[&block.raw_hash(), &size, &self.config.max_block_size],
            ));
        }
        Ok(size)
    }

    /// Longest prefix of `queue` that fits one block: at most
    /// `max_block_size_ops` operations whose JSON adds up to no more than
    /// `max_block_size`. The first operation is always taken.
    pub fn pick_block_operations<'a>(&self, queue: &'a [Arc<Operation>]) -> &'a [Arc<Operation>] {
        let mut total = 0usize;
        let mut count = 0usize;
        for op in queue.iter().take(self.config.max_block_size_ops.max(1)) {
            total += op.to_json().len();
            if count > 0 && total > self.config.max_block_size {
                break;
            }
            count += 1;
        }
        &queue[..count]
    }

    /// Seal operations into a new immutable block on top of `prev`.
    pub fn create_and_sign_block(
        &self,
        ops: &[Arc<Operation>],
        prev: Option<&Block>,
        server_user: Option<&str>,
        server_key: Option<&KeyPair>,
    ) -> Result<Block, RulesError> {
        let mut block = Block::new();
        for op in ops {
            block.push_operation(op.clone())?;
        }
        block.set_date(chrono::Utc::now().timestamp_millis())?;
        block.put(F_BLOCK_ID, Value::from(prev.map_or(0, |p| p.block_id() + 1)))?;
        block.put(
            F_PREV_BLOCK_HASH,
            Value::String(prev.map_or("", Block::full_hash).to_string()),
        )?;
        let merkle = self.calculate_merkle_tree_hash(&block)?;
        block.put(F_MERKLE_TREE_HASH, Value::String(merkle))?;
        let sig_merkle = self.calculate_sig_merkle_tree_hash(&block)?;
        block.put(F_SIG_MERKLE_TREE_HASH, Value::String(sig_merkle))?;
        if let Some(user) = server_user {
            block.put(F_BLOCK_SIGNED_BY, Value::String(user.to_string()))?;
        }
        block.put(F_VERSION, Value::from(self.config.block_version))?;
        block.put(F_EXTRA, Value::from(BLOCK_EXTRA))?;
        block.put(F_DETAILS, Value::String(BLOCK_CREATION_DETAILS.to_string()))?;
        let hash = self.calculate_block_hash(&block)?;
        block.put(F_BLOCK_HASH, Value::String(hash))?;
        if let Some(key) = server_key {
            let msg = hash_bytes(block.full_hash())?;
            let sig = key.sign(&msg, SignatureAlgo::Ecdsa)?;
            block.put(F_BLOCK_SIGNATURE, Value::String(sig))?;
        }
        block.make_immutable();
        Ok(block)
    }

    // ---- validation ----

    /// Structural checks of a block against the block it follows.
    pub fn validate_block(
        &self,
        chain: &dyn ChainView,
        block: &Block,
        prev: Option<&Block>,
        validate_signature: bool,
    ) -> Result<(), RulesError> {
        let hash = block.full_hash();
        let mut pid = -1;
        if let Some(prev) = prev {
            if prev.full_hash() != block.prev_block_hash() {
                return Err(self.error(
                    hash,
                    ErrorKind::BlockPrevHash,
                    &[&prev.full_hash(), &block.prev_block_hash(), &hash],
                ));
            }
            pid = prev.block_id();
        }
        if pid + 1 != block.block_id() {
            return Err(self.error(hash, ErrorKind::BlockPrevId, &[&pid, &block.block_id(), &hash]));
        }
        let dup = chain.block_depth(block)?;
        if dup != -1 {
            return Err(self.error(
                hash,
                ErrorKind::BlockHashIsDuplicated,
                &[&hash, &block.block_id(), &dup],
            ));
        }
        if block.operations().is_empty() {
            return Err(self.error(hash, ErrorKind::BlockEmpty, &[&hash]));
        }
        let merkle = self.calculate_merkle_tree_hash(block)?;
        if merkle != block.merkle_tree_hash() {
            return Err(self.error(
                hash,
                ErrorKind::BlockMerkleTreeFailed,
                &[&hash, &merkle, &block.merkle_tree_hash()],
            ));
        }
        let sig_merkle = self.calculate_sig_merkle_tree_hash(block)?;
        if sig_merkle != block.sig_merkle_tree_hash() {
            return Err(self.error(
                hash,
                ErrorKind::BlockSigMerkleTreeFailed,
                &[&hash, &sig_merkle, &block.sig_merkle_tree_hash()],
            ));
        }
        let calculated = self.calculate_block_hash(block)?;
        if calculated != hash {
            return Err(self.error(hash, ErrorKind::BlockHashFailed, &[&hash, &calculated]));
        }
        if !validate_signature {
            return Ok(());
        }
        let signed_by = block.signed_by().unwrap_or("");
        let key_obj = self.login_key_obj(chain, signed_by)?;
        let valid = match (key_obj, hash_bytes(hash)) {
            (Some(obj), Ok(msg)) => verify_with(&obj, &msg, block.signature().unwrap_or("")),
            _ => false,
        };
        if !valid {
            return Err(self.error(hash, ErrorKind::BlockSignatureFailed, &[&hash, &signed_by]));
        }
        Ok(())
    }

    /// Key object of a signer: `sys.signup[name]` for a plain name,
    /// `sys.login[nick, site]` for `nick:site`.
    pub fn login_key_obj(
        &self,
        chain: &dyn ChainView,
        signed_by: &str,
    ) -> StoreResult<Option<Arc<OpObject>>> {
        match signed_by.split_once(USER_LOGIN_CHAR) {
            None => chain.object_by_name(OP_SIGNUP, &CompoundKey::primary(signed_by, None)),
            Some((nick, site)) => {
                chain.object_by_name(OP_LOGIN, &CompoundKey::primary(nick, Some(site)))
            }
        }
    }

    /// Every signer must have produced the matching signature over the
    /// operation hash. A signup may be signed with the key it creates when
    /// no signup of that name exists yet (or the existing one uses oauth).
    pub fn validate_signatures(&self, chain: &dyn ChainView, op: &Operation) -> Result<(), RulesError> {
        let hash = op.hash().unwrap_or("");
        let sigs = op.signatures();
        let signed_by = op.signed_by();
        if signed_by.is_empty() || signed_by.len() != sigs.len() {
            return Err(self.error(
                hash,
                ErrorKind::OpSignatureFailed,
                &[&hash, &id_string(&signed_by)],
            ));
        }
        let msg = hash_bytes(hash)?;
        let mut self_signer = None;
        if op.op_type() == OP_SIGNUP && op.created().len() == 1 {
            if let Some(name) = op.created()[0].id().into_iter().next() {
                let existing = chain.object_by_name(OP_SIGNUP, &CompoundKey::primary(&name, None))?;
                if existing.map_or(true, |o| o.get_str(F_AUTH_METHOD) == Some(METHOD_OAUTH)) {
                    self_signer = Some(name);
                }
            }
        }
        for (sig, signer) in sigs.iter().zip(&signed_by) {
            let valid = if self_signer.as_deref() == Some(signer.as_str()) {
                verify_with(&op.created()[0], &msg, sig)
            } else {
                match self.login_key_obj(chain, signer)? {
                    Some(obj) => verify_with(&obj, &msg, sig),
                    None => false,
                }
            };
            if !valid {
                return Err(self.error(hash, ErrorKind::OpSignatureFailed, &[&hash, signer]));
            }
        }
        Ok(())
    }

    /// Full check of a prepared operation: hash, size, signatures and rules.
    pub fn validate_op(
        &self,
        chain: &dyn ChainView,
        op: &Operation,
        ctx: &LocalValidationCtx,
    ) -> Result<(), RulesError> {
        let stored = op.hash().unwrap_or("");
        let calculated = self.calculate_operation_hash(op);
        if calculated != stored {
            return Err(self.error(stored, ErrorKind::OpHashIsNotCorrect, &[&calculated, &stored]));
        }
        let size = op.to_json().len();
        if size > self.config.max_op_size {
            return Err(self.error(
                stored,
                ErrorKind::OpSizeIsExceeded,
                &[&stored, &size, &self.config.max_op_size],
            ));
        }
        if self.config.validate_signatures && !ctx.skip_sig_validation {
            self.validate_signatures(chain, op)?;
        }
        self.validate_rules(chain, op, ctx)
    }

    /// Built-in role and grant checks, then every `sys.validate` rule
    /// registered for the operation type and for `*`.
    pub fn validate_rules(
        &self,
        chain: &dyn ChainView,
        op: &Operation,
        ctx: &LocalValidationCtx,
    ) -> Result<(), RulesError> {
        let hash = op.hash().unwrap_or("");
        match op.op_type() {
            OP_VALIDATE => {
                for obj in op.created() {
                    if let Err(e) = CompiledRule::compile(obj) {
                        return Err(self.error(hash, ErrorKind::OpInvalidValidateExpression, &[&hash, &e]));
                    }
                }
            }
            OP_ROLE => {
                let roles = self.roles(chain)?;
                for obj in op.created() {
                    let Some(role_id) = obj.id().into_iter().next() else {
                        continue;
                    };
                    for super_role in obj.get_string_list(F_SUPER_ROLES) {
                        if roles.covers(&role_id, &super_role) {
                            return Err(self.error(
                                hash,
                                ErrorKind::OpRoleSuperRoleCircularRef,
                                &[&hash, &super_role, &role_id],
                            ));
                        }
                        if !roles.contains_role(&super_role) {
                            return Err(self.error(
                                hash,
                                ErrorKind::OpRoleSuperRoleDoesntExist,
                                &[&hash, &super_role, &role_id],
                            ));
                        }
                    }
                }
            }
            OP_GRANT => {
                let roles = self.roles(chain)?;
                for obj in op.created() {
                    for role in obj.get_string_list(F_ROLES) {
                        if !roles.contains_role(&role) {
                            return Err(self.error(
                                hash,
                                ErrorKind::OpGrantRoleDoesntExist,
                                &[&hash, &role, &id_string(&obj.id())],
                            ));
                        }
                    }
                }
            }
            _ => {}
        }

        let rules = self.validation_rules(chain)?;
        let applicable: Vec<&Arc<CompiledRule>> = rules
            .for_type(op.op_type())
            .iter()
            .chain(rules.for_type(WILDCARD_RULE))
            .collect();
        if applicable.is_empty() {
            return Ok(());
        }
        let json = rule_context(op, ctx);
        let signer_roles = ChainRoles { rules: self, chain };
        let eval = EvalContext::with_roles(&json, &signer_roles);
        for rule in applicable {
            self.validate_rule(op, rule, &eval)?;
        }
        Ok(())
    }

    fn validate_rule(
        &self,
        op: &Operation,
        rule: &CompiledRule,
        eval: &EvalContext<'_>,
    ) -> Result<(), RulesError> {
        let hash = op.hash().unwrap_or("");
        let failed = |detail: &dyn fmt::Display| {
            self.error(
                hash,
                ErrorKind::OpValidationFailed,
                &[&hash, &id_string(&rule.id), detail],
            )
        };
        for cond in &rule.ifs {
            match cond.evaluate_bool(eval) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => return Err(failed(&e)),
            }
        }
        for check in &rule.validates {
            match check.evaluate_bool(eval) {
                Ok(true) => {}
                Ok(false) => return Err(failed(&rule.error_message)),
                Err(e) => return Err(failed(&e)),
            }
        }
        Ok(())
    }

    /// Role closure of the chain, cached on its `sys.role` map.
    pub fn roles(&self, chain: &dyn ChainView) -> Result<Arc<RoleClosure>, RulesError> {
        let mut req = ObjectsSearchRequest::cached();
        chain.fetch_all_objects(OP_ROLE, &mut req)?;
        if let Some(cached) = req.cache::<RoleClosure>() {
            return Ok(cached);
        }
        let closure = Arc::new(RoleClosure::from_roles(req.result.iter().map(Arc::as_ref)));
        debug!(roles = closure.len(), "role closure computed");
        chain.set_cache_after_search(&req, closure.clone());
        Ok(closure)
    }

    /// Compiled validation rules of the chain, cached on its
    /// `sys.validate` map.
    pub fn validation_rules(&self, chain: &dyn ChainView) -> Result<Arc<ValidationRules>, RulesError> {
        let mut req = ObjectsSearchRequest::cached();
        chain.fetch_all_objects(OP_VALIDATE, &mut req)?;
        if let Some(cached) = req.cache::<ValidationRules>() {
            return Ok(cached);
        }
        let rules = Arc::new(ValidationRules::from_objects(
            req.result.iter().map(Arc::as_ref),
        )?);
        chain.set_cache_after_search(&req, rules.clone());
        Ok(rules)
    }
}

/// Evaluation input of a rule: the operation JSON with `ref`, `old` and
/// `new` replaced by the resolved objects.
fn rule_context(op: &Operation, ctx: &LocalValidationCtx) -> Value {
    let mut root = match op.to_value(false) {
        Value::Object(m) => m,
        _ => Map::new(),
    };
    let refs: Map<String, Value> = ctx
        .ref_objs
        .iter()
        .map(|(name, obj)| (name.clone(), typed_json(obj)))
        .collect();
    let old: Vec<Value> = ctx
        .deleted_objs
        .iter()
        .chain(ctx.new_objs.iter().filter_map(|(_, old)| old.as_ref()))
        .map(|o| typed_json(o))
        .collect();
    let new: Vec<Value> = ctx.new_objs.iter().map(|(n, _)| n.to_value()).collect();
    root.insert("ref".into(), Value::Object(refs));
    root.insert("old".into(), Value::Array(old));
    root.insert("new".into(), Value::Array(new));
    Value::Object(root)
}

fn typed_json(obj: &OpObject) -> Value {
    let mut v = obj.to_value();
    if let Value::Object(m) = &mut v {
        let t = obj
            .parent_type()
            .map_or(Value::Null, |t| Value::String(t.to_string()));
        m.insert(F_TYPE.into(), t);
    }
    v
}

fn verifying_key(obj: &OpObject) -> Result<VerifyingKey, CryptoError> {
    let algo = obj.get_str(F_ALGO).unwrap_or("");
    if algo != ALGO_EC {
        return Err(CryptoError::UnsupportedAlgorithm(algo.to_string()));
    }
    VerifyingKey::from_encoded(obj.get_str(F_PUBKEY).unwrap_or(""))
}

fn verify_with(key_obj: &OpObject, msg: &[u8], signature: &str) -> bool {
    match verifying_key(key_obj).and_then(|k| k.verify(msg, signature)) {
        Ok(valid) => valid,
        Err(e) => {
            debug!(error = %e, "signature check failed");
            false
        }
    }
}

/// Resolves `auth:has_sig_roles` through `sys.grant` objects and the role
/// closure.
struct ChainRoles<'a> {
    rules: &'a OpBlockchainRules,
    chain: &'a dyn ChainView,
}

impl SignerRoles for ChainRoles<'_> {
    fn has_role(&self, signer: &str, role: &str) -> Result<bool, ExprError> {
        let lookup = |name: &str| {
            self.chain
                .object_by_name(OP_GRANT, &CompoundKey::primary(name, None))
                .map_err(|e| ExprError::eval(e.to_string()))
        };
        let mut grant = lookup(signer)?;
        if grant.is_none() {
            if let Some((nick, _)) = signer.split_once(USER_LOGIN_CHAR) {
                grant = lookup(nick)?;
            }
        }
        let Some(grant) = grant else {
            return Ok(false);
        };
        let closure = self
            .rules
            .roles(self.chain)
            .map_err(|e| ExprError::eval(e.to_string()))?;
        Ok(grant
            .get_string_list(F_ROLES)
            .iter()
            .any(|g| g == role || closure.covers(g, role)))
    }
}
