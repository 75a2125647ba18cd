use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Session role, derived from the login user name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Customer,
}

/// Cleartext credentials: the configured admin user authenticates with the
/// admin password, every other user name with the shared customer password.
#[derive(Debug, Clone)]
pub struct SlotbookAuthSource {
    password: String,
    admin_user: String,
    admin_password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String, admin_user: String, admin_password: String) -> Self {
        Self {
            password,
            admin_user,
            admin_password,
        }
    }

    pub fn role_of(&self, user: Option<&str>) -> Role {
        role_for(&self.admin_user, user)
    }
}

pub fn role_for(admin_user: &str, user: Option<&str>) -> Role {
    match user {
        Some(u) if u == admin_user => Role::Admin,
        _ => Role::Customer,
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let expected = match self.role_of(login.user()) {
            Role::Admin => &self.admin_password,
            Role::Customer => &self.password,
        };
        Ok(Password::new(None, expected.as_bytes().to_vec()))
    }
}
