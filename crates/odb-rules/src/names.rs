//! Names of system operation types and their well-known fields.

pub const OP_TYPE_SYS: &str = "sys.";

pub const OP_LOGIN: &str = "sys.login";
pub const OP_SIGNUP: &str = "sys.signup";
pub const OP_ROLE: &str = "sys.role";
pub const OP_GRANT: &str = "sys.grant";
pub const OP_VALIDATE: &str = "sys.validate";
pub const OP_VOTE: &str = "sys.vote";
pub const OP_LIMIT: &str = "sys.limit";
pub const OP_TABLE: &str = "sys.table";
pub const OP_OPERATION: &str = "sys.operation";
pub const OP_BOT: &str = "sys.bot";

/// Rule type that applies to every operation.
pub const WILDCARD_RULE: &str = "*";

// login, signup
pub const F_ALGO: &str = "algo";
pub const F_PUBKEY: &str = "pubkey";
pub const F_SALT: &str = "salt";
pub const F_AUTH_METHOD: &str = "auth_method";
pub const F_OAUTH_PROVIDER: &str = "oauth_provider";
pub const F_OAUTHID_HASH: &str = "oauthid_hash";
pub const F_KEYGEN_METHOD: &str = "keygen_method";
pub const F_DETAILS: &str = "details";

// role, grant, validate
pub const F_TYPE: &str = "type";
pub const F_ROLES: &str = "roles";
pub const F_ERROR_MESSAGE: &str = "error_message";
pub const F_VALIDATE: &str = "validate";
pub const F_IF: &str = "if";

// vote
/// Operation proposed by a vote object.
pub const F_OP: &str = "op";
pub const F_SUBMITTED_OP_HASH: &str = "submitted_op_hash";
pub const STATE_FINAL: &str = "final";

pub const METHOD_OAUTH: &str = "oauth";
pub const METHOD_PWD: &str = "pwd";
pub const METHOD_PROVIDED: &str = "provided";

/// Prefix of operation hashes: the hashed content is JSON.
pub const JSON_MSG_TYPE: &str = "json";

/// Separates nickname and site in a login name. Never valid in a nickname.
pub const USER_LOGIN_CHAR: char = ':';

/// Name of the `ref` entry bound to the `sys.operation` object of an
/// operation's type.
pub const REF_OP: &str = "op";
/// Name of the `ref` entry pointing at the vote being finalized.
pub const REF_VOTE: &str = "vote";
