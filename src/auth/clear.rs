use async_trait::async_trait;

use super::{
    strip_nul, AuthResult, AuthState, AuthenticationData, AuthenticatorModule, BackendToken,
    ClientAuthenticator, ExchangeResult,
};
use crate::protocol::{password_double_sha1, AuthSwitchRequest, CLEAR_PASSWORD_PLUGIN};

/// mysql_clear_password, checked against the stored native hash
pub struct ClearPasswordModule;

impl AuthenticatorModule for ClearPasswordModule {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn supported_plugins(&self) -> &[&'static str] {
        &[CLEAR_PASSWORD_PLUGIN]
    }

    fn create_client_authenticator(&self) -> Box<dyn ClientAuthenticator> {
        Box::new(ClearAuthenticator {
            state: AuthState::Init,
        })
    }
}

struct ClearAuthenticator {
    state: AuthState,
}

#[async_trait]
impl ClientAuthenticator for ClearAuthenticator {
    fn exchange(&mut self, payload: &[u8], data: &mut AuthenticationData) -> ExchangeResult {
        match self.state {
            AuthState::Init if data.client_plugin == CLEAR_PASSWORD_PLUGIN => {
                data.client_token = strip_nul(&data.client_token).to_vec();
                self.state = AuthState::Received;
                ExchangeResult::Ready
            }
            AuthState::Init => {
                self.state = AuthState::AskedForPassword;
                let switch = AuthSwitchRequest::new(CLEAR_PASSWORD_PLUGIN, &[]);
                ExchangeResult::Incomplete(switch.encode(0).payload)
            }
            AuthState::AskedForPassword => {
                data.client_token = strip_nul(payload).to_vec();
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
        let Ok(password) = String::from_utf8(data.client_token.clone()) else {
            return AuthResult::WrongPassword;
        };

        let matches = match &account.password_sha2 {
            None => password.is_empty(),
            Some(stored) => !password.is_empty() && password_double_sha1(&password) == *stored,
        };
        if !matches {
            return AuthResult::WrongPassword;
        }

        data.backend_token = if password.is_empty() {
            BackendToken::None
        } else {
            BackendToken::Cleartext(password)
        };
        AuthResult::Success(None)
    }

    fn state(&self) -> AuthState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserAccount;

    fn account(password: &str) -> UserAccount {
        UserAccount {
            user: "app".into(),
            host_pattern: "%".into(),
            password_sha2: Some(password_double_sha1(password)),
            plugin: CLEAR_PASSWORD_PLUGIN.into(),
            databases: vec!["*".into()],
            shutdown_priv: false,
        }
    }

    #[tokio::test]
    async fn test_asks_for_password() {
        let mut data = AuthenticationData::new("app", "h", [0; 20]);
        data.client_plugin = "mysql_native_password".into();
        data.account = Some(account("pw"));

        let mut auth = ClearPasswordModule.create_client_authenticator();
        let ExchangeResult::Incomplete(payload) = auth.exchange(b"", &mut data) else {
            panic!("expected auth switch");
        };
        assert_eq!(
            AuthSwitchRequest::parse(&payload).unwrap().plugin_name,
            CLEAR_PASSWORD_PLUGIN
        );

        assert_eq!(auth.exchange(b"pw\0", &mut data), ExchangeResult::Ready);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::Success(None));
        assert_eq!(data.backend_token, BackendToken::Cleartext("pw".into()));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let mut data = AuthenticationData::new("app", "h", [0; 20]);
        data.client_plugin = CLEAR_PASSWORD_PLUGIN.into();
        data.client_token = b"nope\0".to_vec();
        data.account = Some(account("pw"));

        let mut auth = ClearPasswordModule.create_client_authenticator();
        assert_eq!(auth.exchange(b"", &mut data), ExchangeResult::Ready);
        assert_eq!(auth.authenticate(&mut data).await, AuthResult::WrongPassword);
        assert_eq!(auth.exchange(b"", &mut data), ExchangeResult::Error);
    }
}
