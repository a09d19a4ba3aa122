use crate::parser::{Classification, TypeMask};
use crate::protocol::status;
use crate::router::{Completion, RouteContext};

/// Session state tracking
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Unique session ID, also the thread id the client sees
    pub id: u64,
    /// Client username
    pub username: String,
    /// Client address
    pub host: String,
    /// Current database
    pub database: Option<String>,
    /// Database of a USE or COM_INIT_DB whose reply is outstanding
    pub pending_database: Option<String>,
    pub autocommit: bool,
    /// Whether client is in a transaction
    pub in_transaction: bool,
    pub read_only_transaction: bool,
    /// Client capability flags
    pub capability_flags: u32,
    /// Character set
    pub character_set: u8,
}

impl SessionState {
    pub fn new(id: u64, host: &str) -> Self {
        Self {
            id,
            username: String::new(),
            host: host.to_string(),
            database: None,
            pending_database: None,
            autocommit: true,
            in_transaction: false,
            read_only_transaction: false,
            capability_flags: 0,
            character_set: 0,
        }
    }

    /// Update state after parsing handshake response
    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
    }

    /// Start a transaction
    pub fn begin_transaction(&mut self, read_only: bool) {
        self.in_transaction = true;
        self.read_only_transaction = read_only;
    }

    /// End a transaction
    pub fn end_transaction(&mut self) {
        self.in_transaction = false;
        self.read_only_transaction = false;
    }

    /// Change current database
    pub fn change_database(&mut self, db: String) {
        self.database = Some(db);
    }

    /// Note the effect a statement will have once it succeeds.
    ///
    /// Transaction flags change immediately so that statements pipelined
    /// behind a BEGIN are routed as part of the transaction. The reply
    /// status corrects them in [`SessionState::on_completion`].
    pub fn on_statement(&mut self, classification: &Classification) {
        let mask = classification.mask;

        if mask.contains(TypeMask::USE_DB) {
            self.pending_database = classification.database.clone();
        }
        if mask.contains(TypeMask::BEGIN_TRX) {
            self.begin_transaction(mask.contains(TypeMask::READONLY));
        }
        if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            self.end_transaction();
        }
        if mask.contains(TypeMask::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
        }
        if mask.contains(TypeMask::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
            self.end_transaction();
        }
    }

    /// Apply the outcome of a finished reply
    pub fn on_completion(&mut self, completion: Completion) {
        let pending = self.pending_database.take();
        if !completion.ok {
            return;
        }
        if let Some(db) = pending {
            self.change_database(db);
        }

        // Replies the proxy generated leave the flags as they are
        let Some(flags) = completion.server_status else {
            return;
        };
        self.autocommit = flags & status::SERVER_STATUS_AUTOCOMMIT != 0;
        self.in_transaction = flags & status::SERVER_STATUS_IN_TRANS != 0;
        self.read_only_transaction =
            self.in_transaction && flags & status::SERVER_STATUS_IN_TRANS_READONLY != 0;
    }

    /// Forget everything tied to the previous user
    pub fn reset_for_user(&mut self, username: String, database: Option<String>) {
        self.username = username;
        self.database = database;
        self.pending_database = None;
        self.autocommit = true;
        self.end_transaction();
    }

    /// Status flags for OK packets the proxy generates itself
    pub fn server_status(&self) -> u16 {
        let mut flags = 0;
        if self.autocommit {
            flags |= status::SERVER_STATUS_AUTOCOMMIT;
        }
        if self.in_transaction {
            flags |= status::SERVER_STATUS_IN_TRANS;
            if self.read_only_transaction {
                flags |= status::SERVER_STATUS_IN_TRANS_READONLY;
            }
        }
        flags
    }

    /// Flags the router sessions decide on
    pub fn route_context(&self, backend_user: &str) -> RouteContext {
        RouteContext {
            user: backend_user.to_string(),
            current_db: self.database.clone(),
            autocommit: self.autocommit,
            trx_active: self.in_transaction,
            trx_read_only: self.read_only_transaction,
        }
    }
}
