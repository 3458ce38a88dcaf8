use std::fmt;

/// Credentials holds the single username/password pair the server
/// accepts. It is built once at startup and only read afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// verify checks a presented pair against the stored one. Both fields
    /// are always compared so timing does not reveal which one differed.
    pub fn verify(&self, username: &[u8], password: &[u8]) -> bool {
        let user_match = constant_time_eq(username, self.username.as_bytes());
        let pass_match = constant_time_eq(password, self.password.as_bytes());
        user_match & pass_match
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// constant_time_eq compares lengths first, then every byte without an
/// early exit
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}
