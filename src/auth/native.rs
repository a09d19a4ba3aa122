use async_trait::async_trait;
use tracing::debug;

use super::{
    AuthResult, AuthState, AuthenticationData, AuthenticatorModule, BackendToken,
    ClientAuthenticator, ExchangeResult,
};
use crate::protocol::{check_native_token, AuthSwitchRequest, NATIVE_PASSWORD_PLUGIN};

/// mysql_native_password
pub struct NativePasswordModule;

impl AuthenticatorModule for NativePasswordModule {
    fn name(&self) -> &'static str {
        "native"
    }

    fn supported_plugins(&self) -> &[&'static str] {
        &[NATIVE_PASSWORD_PLUGIN]
    }

    fn create_client_authenticator(&self) -> Box<dyn ClientAuthenticator> {
        Box::new(NativeAuthenticator {
            state: AuthState::Init,
        })
    }
}

struct NativeAuthenticator {
    state: AuthState,
}

#[async_trait]
impl ClientAuthenticator for NativeAuthenticator {
    fn exchange(&mut self, payload: &[u8], data: &mut AuthenticationData) -> ExchangeResult {
        match self.state {
            AuthState::Init if data.client_plugin == NATIVE_PASSWORD_PLUGIN => {
                // Token came with the handshake response
                self.state = AuthState::Received;
                ExchangeResult::Ready
            }
            AuthState::Init => {
                debug!(user = %data.user, plugin = %data.client_plugin, "Switching client to native password");
                self.state = AuthState::AskedForPassword;
                let switch = AuthSwitchRequest::native(&data.scramble);
                ExchangeResult::Incomplete(switch.encode(0).payload)
            }
            AuthState::AskedForPassword => {
                data.client_token = payload.to_vec();
                self.state = AuthState::Received;
                ExchangeResult::Ready
            }
            _ => ExchangeResult::Error,
        }
    }

    async fn authenticate(&mut self, data: &mut AuthenticationData) -> AuthResult {
        if self.state != AuthState::Received {
            return AuthResult::Error("authentication attempted before all data was received".into());
        }
        self.state = AuthState::Done;

        let Some(account) = &data.account else {
            return AuthResult::WrongPassword;
        };

        match (&account.password_sha2, data.client_token.is_empty()) {
            (None, true) => {
                data.backend_token = BackendToken::None;
                AuthResult::Success(None)
            }
            (None, false) | (Some(_), true) => AuthResult::WrongPassword,
            (Some(stored), false) => {
                match check_native_token(&data.client_token, &data.scramble, stored) {
                    Some(hash1) => {
                        data.backend_token = BackendToken::NativeHash(hash1);
                        AuthResult::Success(None)
                    }
                    None => AuthResult::WrongPassword,
                }
            }
        }
    }

    fn state(&self) -> AuthState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserAccount;
    use crate::protocol::{compute_auth_response, password_double_sha1, password_sha1};

    fn data_for(password: Option<&str>, plugin: &str, token: Vec<u8>) -> AuthenticationData {
        let mut data = AuthenticationData::new("app", "10.0.0.1", [7; 20]);
        data.client_plugin = plugin.into();
        data.client_token = token;
        data.account = Some(UserAccount {
            user: "app".into(),
            host_pattern: "%".into(),
            password_sha2: password.map(password_double_sha1),
            plugin: NATIVE_PASSWORD_PLUGIN.into(),
            databases: vec!["*".into()],
            shutdown_priv: false,
        });
        data
    }

    #[tokio::test]
    async fn test_token_from_handshake() {
        let token = compute_auth_response("secret", &[7; 20]);
        let mut data = data_for(Some("secret"), NATIVE_PASSWORD_PLUGIN, token);
        let mut auth = NativePasswordModule.create_client_authenticator();

        assert_eq!(auth.exchange(b"", &mut data), ExchangeResult::Ready);
        assert_eq!(auth.state(), AuthState::Received);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::Success(None));
        assert_eq!(data.backend_token, BackendToken::NativeHash(password_sha1("secret")));

        // Nothing more to exchange once done
        assert_eq!(auth.exchange(b"", &mut data), ExchangeResult::Error);
    }

    #[tokio::test]
    async fn test_switch_when_client_used_other_plugin() {
        let mut data = data_for(Some("secret"), "caching_sha2_password", vec![1, 2, 3]);
        let mut auth = NativePasswordModule.create_client_authenticator();

        let ExchangeResult::Incomplete(payload) = auth.exchange(b"", &mut data) else {
            panic!("expected auth switch");
        };
        let switch = AuthSwitchRequest::parse(&payload).unwrap();
        assert_eq!(switch.plugin_name, NATIVE_PASSWORD_PLUGIN);
        assert_eq!(switch.plugin_data, vec![7; 20]);

        let token = compute_auth_response("secret", &[7; 20]);
        assert_eq!(auth.exchange(&token, &mut data), ExchangeResult::Ready);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::Success(None));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let token = compute_auth_response("wrong", &[7; 20]);
        let mut data = data_for(Some("secret"), NATIVE_PASSWORD_PLUGIN, token);
        let mut auth = NativePasswordModule.create_client_authenticator();
        auth.exchange(b"", &mut data);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::WrongPassword);
    }

    #[tokio::test]
    async fn test_empty_passwords() {
        let mut data = data_for(None, NATIVE_PASSWORD_PLUGIN, Vec::new());
        let mut auth = NativePasswordModule.create_client_authenticator();
        auth.exchange(b"", &mut data);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::Success(None));
        assert_eq!(data.backend_token, BackendToken::None);

        // Account has a password but the client sent none
        let mut data = data_for(Some("secret"), NATIVE_PASSWORD_PLUGIN, Vec::new());
        let mut auth = NativePasswordModule.create_client_authenticator();
        auth.exchange(b"", &mut data);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::WrongPassword);
    }

    #[tokio::test]
    async fn test_unknown_account_is_rejected() {
        let token = compute_auth_response("secret", &[7; 20]);
        let mut data = data_for(Some("secret"), NATIVE_PASSWORD_PLUGIN, token);
        data.account = None;
        let mut auth = NativePasswordModule.create_client_authenticator();
        auth.exchange(b"", &mut data);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::WrongPassword);
    }

    #[tokio::test]
    async fn test_authenticate_requires_received_state() {
        let mut data = data_for(None, "other", Vec::new());
        let mut auth = NativePasswordModule.create_client_authenticator();
        auth.exchange(b"", &mut data);
        assert!(matches!(auth.authenticate(&mut data).await, AuthResult::Error(_)));
    }
}
