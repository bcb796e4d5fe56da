//! Fixtures shared by the chain tests.

use std::sync::Arc;

use odb_crypto::KeyPair;
use odb_rules::names::{OP_GRANT, OP_LOGIN, OP_ROLE, OP_SIGNUP, OP_VALIDATE};
use odb_rules::{OpBlockchainRules, RulesConfig};
use odb_types::{OpObject, Operation};
use serde_json::{json, Value};

use crate::chain::OpBlockChain;

pub(crate) const ADMIN: &str = "admin";
pub(crate) const PLACE: &str = "osm.place";

pub(crate) fn obj(value: Value) -> OpObject {
    OpObject::from_value(value).unwrap()
}

/// Unsigned operation creating one object per id.
pub(crate) fn create_op(rules: &OpBlockchainRules, op_type: &str, ids: &[&str]) -> Operation {
    let mut op = Operation::new(op_type);
    for id in ids {
        op.add_created(OpObject::with_id(&[*id])).unwrap();
    }
    rules.generate_hash_and_sign(&mut op, &[]).unwrap();
    op
}

/// Unsigned operation with arbitrary content, hashed.
pub(crate) fn hashed(rules: &OpBlockchainRules, mut op: Operation) -> Operation {
    rules.generate_hash_and_sign(&mut op, &[]).unwrap();
    op
}

/// Edit of one object: `change` and `current` maps as given.
pub(crate) fn edit_op(rules: &OpBlockchainRules, op_type: &str, id: &str, change: Value, current: Value) -> Operation {
    let mut op = Operation::new(op_type);
    let mut edit = json!({"id": [id], "change": change});
    if !current.is_null() {
        edit["current"] = current;
    }
    op.add_edited(obj(edit)).unwrap();
    hashed(rules, op)
}

/// Permissive rules and an empty root, with `blocks` blocks of one
/// operation each.
pub(crate) fn filled_root(blocks: usize) -> (Arc<OpBlockchainRules>, Arc<OpBlockChain>) {
    let rules = Arc::new(OpBlockchainRules::new(RulesConfig::permissive()));
    let root = OpBlockChain::new_root(rules.clone());
    fill(&root, blocks, "root");
    (rules, root)
}

/// Append `blocks` blocks, each creating `test.item[<tag>-<n>]`.
pub(crate) fn fill(chain: &OpBlockChain, blocks: usize, tag: &str) {
    for n in 0..blocks {
        let id = format!("{tag}-{n}");
        chain
            .add_operation(create_op(chain.rules(), "test.item", &[&id]), None)
            .unwrap();
        chain.create_block(None, None).unwrap();
    }
}

/// Signing rules with an admin that owns every role.
pub(crate) struct Fixture {
    pub rules: Arc<OpBlockchainRules>,
    pub admin: KeyPair,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            rules: Arc::new(OpBlockchainRules::default()),
            admin: KeyPair::generate(),
        }
    }

    pub fn key_json(id: Value, kp: &KeyPair) -> Value {
        json!({
            "id": id,
            "algo": "EC",
            "auth_method": "provided",
            "pubkey": kp.verifying_key().to_encoded().unwrap(),
        })
    }

    pub fn signed(&self, mut op: Operation, signer: &str, kp: &KeyPair) -> Operation {
        op.set_signed_by(signer).unwrap();
        self.rules.generate_hash_and_sign(&mut op, &[kp]).unwrap();
        op
    }

    pub fn signup(&self, name: &str, kp: &KeyPair) -> Operation {
        let mut op = Operation::new(OP_SIGNUP);
        op.add_created(obj(Self::key_json(json!([name]), kp))).unwrap();
        self.signed(op, name, kp)
    }

    /// Login key `nick:site` registered by the owner of `nick`.
    pub fn login(&self, nick: &str, site: &str, owner: &KeyPair, login: &KeyPair) -> Operation {
        let mut op = Operation::new(OP_LOGIN);
        op.add_created(obj(Self::key_json(json!([nick, site]), login))).unwrap();
        self.signed(op, nick, owner)
    }

    pub fn admin_op(&self, op_type: &str, created: Value) -> Operation {
        let mut op = Operation::new(op_type);
        op.add_created(obj(created)).unwrap();
        self.signed(op, ADMIN, &self.admin)
    }

    pub fn place(&self, signer: &str, kp: &KeyPair, id: &str) -> Operation {
        let mut op = Operation::new(PLACE);
        op.add_created(obj(json!({"id": [id], "name": id}))).unwrap();
        self.signed(op, signer, kp)
    }

    /// Root layer with one block: the admin signup, roles `owner` and
    /// `editor` (below `owner`), a grant of `owner` to the admin and a
    /// rule that only editors may write places.
    pub fn bootstrap(&self) -> Arc<OpBlockChain> {
        let chain = OpBlockChain::new_root(self.rules.clone());
        let ops = [
            self.signup(ADMIN, &self.admin),
            self.admin_op(OP_ROLE, json!({"id": ["owner"], "comment": "Owner"})),
            self.admin_op(OP_ROLE, json!({"id": ["editor"], "super_roles": ["owner"]})),
            self.admin_op(OP_GRANT, json!({"id": [ADMIN], "roles": ["owner"]})),
            self.admin_op(
                OP_VALIDATE,
                json!({
                    "id": ["places_need_editor"],
                    "type": [PLACE],
                    "validate": ["auth:has_sig_roles(this, 'editor')"],
                    "error_message": "editor role required",
                }),
            ),
        ];
        for op in ops {
            chain.add_operation(op, None).unwrap();
        }
        chain.create_block(Some(ADMIN), Some(&self.admin)).unwrap();
        chain
    }
}
