//! PAM authentication
//!
//! The client is switched to the `dialog` plugin (or `mysql_clear_password`)
//! so that the password arrives in clear text. The password, and in two-factor
//! mode a verification code, is then handed to a [`PamService`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tracing::{info, warn};

use super::{
    strip_nul, AuthResult, AuthState, AuthenticationData, AuthenticatorModule, BackendToken,
    ClientAuthenticator, ExchangeResult,
};
use crate::config::{PamConfig, PamMode};
use crate::protocol::{password_sha1, AuthSwitchRequest, CLEAR_PASSWORD_PLUGIN, DIALOG_PLUGIN};

pub const PAM_PLUGIN: &str = "pam";

const DIALOG_ECHO_DISABLED: u8 = 0x04;
const PASSWORD_QUERY: &str = "Password: ";
const TWO_FA_QUERY: &str = "Verification code: ";

/// Credentials handed to the PAM stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamRequest {
    pub service: String,
    pub user: String,
    pub host: String,
    pub password: String,
    pub two_fa_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PamOutcome {
    Success { mapped_user: Option<String> },
    WrongPassword(String),
    Error(String),
}

/// Out-of-band PAM conversation.
///
/// Implementations may block; they are called from tokio's blocking pool.
pub trait PamService: Send + Sync {
    fn authenticate(&self, request: &PamRequest) -> PamOutcome;
}

/// PAM service answering from a fixed credential table
#[derive(Debug, Default)]
pub struct StaticPamService {
    accounts: HashMap<String, crate::config::PamAccount>,
}

impl StaticPamService {
    pub fn from_config(config: &PamConfig) -> Self {
        Self {
            accounts: config
                .accounts
                .iter()
                .map(|a| (a.user.clone(), a.clone()))
                .collect(),
        }
    }
}

impl PamService for StaticPamService {
    fn authenticate(&self, request: &PamRequest) -> PamOutcome {
        let Some(account) = self.accounts.get(&request.user) else {
            return PamOutcome::WrongPassword(format!("PAM user '{}' not found", request.user));
        };
        if account.password != request.password {
            return PamOutcome::WrongPassword(format!(
                "Wrong password for PAM user '{}'",
                request.user
            ));
        }
        if let Some(expected) = &account.otp {
            if request.two_fa_code.as_deref() != Some(expected.as_str()) {
                return PamOutcome::WrongPassword(format!(
                    "Wrong verification code for PAM user '{}'",
                    request.user
                ));
            }
        }
        PamOutcome::Success {
            mapped_user: account.mapped_user.clone(),
        }
    }
}

pub struct PamModule {
    config: PamConfig,
    service: Arc<dyn PamService>,
    /// SHA1(password) of mapped backend users
    backend_passwords: Arc<HashMap<String, [u8; 20]>>,
}

impl PamModule {
    pub fn new(config: PamConfig, service: Arc<dyn PamService>) -> Self {
        if config.use_cleartext_plugin && config.mode == PamMode::PasswordTwoFactor {
            warn!("mysql_clear_password cannot ask for a verification code, only the password is requested");
        }
        let backend_passwords = config
            .backend_passwords
            .iter()
            .map(|(user, pw)| (user.clone(), password_sha1(pw)))
            .collect();
        Self {
            config,
            service,
            backend_passwords: Arc::new(backend_passwords),
        }
    }
}

impl AuthenticatorModule for PamModule {
    fn name(&self) -> &'static str {
        "pam"
    }

    fn supported_plugins(&self) -> &[&'static str] {
        &[PAM_PLUGIN, DIALOG_PLUGIN]
    }

    fn create_client_authenticator(&self) -> Box<dyn ClientAuthenticator> {
        let two_factor =
            self.config.mode == PamMode::PasswordTwoFactor && !self.config.use_cleartext_plugin;
        Box::new(PamAuthenticator {
            state: AuthState::Init,
            cleartext: self.config.use_cleartext_plugin,
            two_factor,
            mapping: self.config.user_mapping,
            service_name: self.config.service.clone(),
            service: Arc::clone(&self.service),
            backend_passwords: Arc::clone(&self.backend_passwords),
        })
    }
}

struct PamAuthenticator {
    state: AuthState,
    cleartext: bool,
    two_factor: bool,
    mapping: bool,
    service_name: String,
    service: Arc<dyn PamService>,
    backend_passwords: Arc<HashMap<String, [u8; 20]>>,
}

impl PamAuthenticator {
    fn auth_switch(&self) -> bytes::Bytes {
        let switch = if self.cleartext {
            AuthSwitchRequest::new(CLEAR_PASSWORD_PLUGIN, &[])
        } else {
            let mut prompt = vec![DIALOG_ECHO_DISABLED];
            prompt.extend_from_slice(PASSWORD_QUERY.as_bytes());
            AuthSwitchRequest::new(DIALOG_PLUGIN, &prompt)
        };
        switch.encode(0).payload
    }

    fn two_fa_prompt() -> bytes::Bytes {
        let mut buf = BytesMut::with_capacity(1 + TWO_FA_QUERY.len());
        buf.put_u8(DIALOG_ECHO_DISABLED);
        buf.extend_from_slice(TWO_FA_QUERY.as_bytes());
        buf.freeze()
    }
}

#[async_trait]
impl ClientAuthenticator for PamAuthenticator {
    fn exchange(&mut self, payload: &[u8], data: &mut AuthenticationData) -> ExchangeResult {
        match self.state {
            AuthState::Init => {
                // Always switch so that the password arrives in clear text
                self.state = AuthState::AskedForPassword;
                ExchangeResult::Incomplete(self.auth_switch())
            }
            AuthState::AskedForPassword => {
                data.client_token = strip_nul(payload).to_vec();
                if self.two_factor {
                    self.state = AuthState::AskedFor2fa;
                    ExchangeResult::Incomplete(Self::two_fa_prompt())
                } else {
                    self.state = AuthState::Received;
                    ExchangeResult::Ready
                }
            }
            AuthState::AskedFor2fa => {
                data.client_token_2fa = strip_nul(payload).to_vec();
                self.state = AuthState::Received;
                ExchangeResult::Ready
            }
            AuthState::Received | AuthState::Done => ExchangeResult::Error,
        }
    }

    async fn authenticate(&mut self, data: &mut AuthenticationData) -> AuthResult {
        if self.state != AuthState::Received {
            return AuthResult::Error("authentication attempted before all data was received".into());
        }
        self.state = AuthState::Done;

        let password = String::from_utf8_lossy(&data.client_token).into_owned();
        let request = PamRequest {
            service: self.service_name.clone(),
            user: data.user.clone(),
            host: data.host.clone(),
            two_fa_code: self
                .two_factor
                .then(|| String::from_utf8_lossy(&data.client_token_2fa).into_owned()),
            password,
        };

        let service = Arc::clone(&self.service);
        let pam_request = request.clone();
        let outcome = match tokio::task::spawn_blocking(move || service.authenticate(&pam_request)).await {
            Ok(outcome) => outcome,
            Err(e) => PamOutcome::Error(format!("PAM conversation failed: {}", e)),
        };

        match outcome {
            PamOutcome::Success { mapped_user } => {
                if !self.mapping {
                    data.backend_token = BackendToken::Cleartext(request.password);
                    return AuthResult::Success(None);
                }

                // Mapped users try passwordless backend login unless a
                // backend password is configured
                data.backend_token = BackendToken::None;
                match mapped_user {
                    Some(mapped) if mapped != data.user => {
                        info!(user = %data.user, mapped = %mapped, "Incoming user mapped to backend user");
                        if let Some(hash) = self.backend_passwords.get(&mapped) {
                            info!(user = %mapped, "Using configured backend password");
                            data.backend_token = BackendToken::NativeHash(*hash);
                        }
                        data.mapped_user = Some(mapped.clone());
                        AuthResult::Success(Some(mapped))
                    }
                    _ => AuthResult::Success(None),
                }
            }
            PamOutcome::WrongPassword(msg) => {
                info!(user = %data.user, "{}", msg);
                AuthResult::WrongPassword
            }
            PamOutcome::Error(msg) => AuthResult::Error(msg),
        }
    }

    fn state(&self) -> AuthState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PamAccount;

    fn pam_config(mode: PamMode, mapping: bool) -> PamConfig {
        let mut config = PamConfig {
            mode,
            user_mapping: mapping,
            ..Default::default()
        };
        config.accounts.push(PamAccount {
            user: "alice".into(),
            password: "pw".into(),
            otp: (mode == PamMode::PasswordTwoFactor).then(|| "123456".into()),
            mapped_user: Some("dba".into()),
        });
        config
            .backend_passwords
            .insert("dba".into(), "dba-secret".into());
        config
    }

    fn module(config: PamConfig) -> PamModule {
        let service = Arc::new(StaticPamService::from_config(&config));
        PamModule::new(config, service)
    }

    #[tokio::test]
    async fn test_dialog_password_only() {
        let module = module(pam_config(PamMode::Password, false));
        let mut data = AuthenticationData::new("alice", "10.0.0.1", [0; 20]);
        let mut auth = module.create_client_authenticator();

        let ExchangeResult::Incomplete(payload) = auth.exchange(b"", &mut data) else {
            panic!("expected auth switch");
        };
        let switch = AuthSwitchRequest::parse(&payload).unwrap();
        assert_eq!(switch.plugin_name, DIALOG_PLUGIN);
        assert_eq!(switch.plugin_data[0], DIALOG_ECHO_DISABLED);
        assert_eq!(&switch.plugin_data[1..], PASSWORD_QUERY.as_bytes());

        assert_eq!(auth.exchange(b"pw\0", &mut data), ExchangeResult::Ready);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::Success(None));
        assert_eq!(data.backend_token, BackendToken::Cleartext("pw".into()));
        assert_eq!(auth.state(), AuthState::Done);
    }

    #[tokio::test]
    async fn test_two_factor_and_mapping() {
        let module = module(pam_config(PamMode::PasswordTwoFactor, true));
        let mut data = AuthenticationData::new("alice", "10.0.0.1", [0; 20]);
        let mut auth = module.create_client_authenticator();

        auth.exchange(b"", &mut data);
        let ExchangeResult::Incomplete(prompt) = auth.exchange(b"pw\0", &mut data) else {
            panic!("expected 2FA prompt");
        };
        assert_eq!(prompt[0], DIALOG_ECHO_DISABLED);
        assert_eq!(auth.state(), AuthState::AskedFor2fa);

        assert_eq!(auth.exchange(b"123456\0", &mut data), ExchangeResult::Ready);
        assert_eq!(
            auth.authenticate(&mut data).await,
            AuthResult::Success(Some("dba".into()))
        );
        assert_eq!(data.effective_user(), "dba");
        assert_eq!(
            data.backend_token,
            BackendToken::NativeHash(password_sha1("dba-secret"))
        );
    }

    #[tokio::test]
    async fn test_wrong_verification_code() {
        let module = module(pam_config(PamMode::PasswordTwoFactor, false));
        let mut data = AuthenticationData::new("alice", "10.0.0.1", [0; 20]);
        let mut auth = module.create_client_authenticator();

        auth.exchange(b"", &mut data);
        auth.exchange(b"pw\0", &mut data);
        auth.exchange(b"000000\0", &mut data);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::WrongPassword);
        assert_eq!(auth.exchange(b"", &mut data), ExchangeResult::Error);
    }

    #[tokio::test]
    async fn test_cleartext_plugin_switch() {
        let mut config = pam_config(PamMode::Password, false);
        config.use_cleartext_plugin = true;
        let module = module(config);
        let mut data = AuthenticationData::new("alice", "10.0.0.1", [0; 20]);
        let mut auth = module.create_client_authenticator();

        let ExchangeResult::Incomplete(payload) = auth.exchange(b"", &mut data) else {
            panic!("expected auth switch");
        };
        assert_eq!(
            AuthSwitchRequest::parse(&payload).unwrap().plugin_name,
            CLEAR_PASSWORD_PLUGIN
        );
    }

    /// Releases the PAM call only once the runtime thread got to run
    struct GatedPam {
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl PamService for GatedPam {
        fn authenticate(&self, _request: &PamRequest) -> PamOutcome {
            let gate = self.gate.lock().unwrap();
            match gate.recv_timeout(std::time::Duration::from_secs(5)) {
                Ok(()) => PamOutcome::Success { mapped_user: None },
                Err(_) => PamOutcome::Error("gate never opened".into()),
            }
        }
    }

    #[tokio::test]
    async fn test_pam_call_does_not_block_the_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        let service = Arc::new(GatedPam {
            gate: std::sync::Mutex::new(rx),
        });
        let module = PamModule::new(pam_config(PamMode::Password, false), service);
        let mut data = AuthenticationData::new("alice", "10.0.0.1", [0; 20]);
        let mut auth = module.create_client_authenticator();
        auth.exchange(b"", &mut data);
        auth.exchange(b"pw\0", &mut data);

        // Only runs if the PAM call left the runtime thread free
        let opener = tokio::spawn(async move {
            let _ = tx.send(());
        });
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::Success(None));
        opener.await.unwrap();
    }
}
