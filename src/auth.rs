/// Trait implemented by SASL authentication mechanisms.
///
/// Most users will use the provided [`Auth`](enum.Auth.html) enum, which
/// covers the mechanisms RabbitMQ ships with.
pub trait Sasl: Default + Clone + Send + 'static {
    /// The mechanism name sent in `connection.start-ok` (e.g. `PLAIN`).
    fn mechanism(&self) -> String;

    /// The SASL response blob for the chosen mechanism.
    fn response(&self) -> String;
}

/// Built-in SASL mechanisms.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    /// Username/password authentication; the RabbitMQ default.
    Plain { username: String, password: String },

    /// Externally provided authentication (e.g. client certificates).
    /// Selected automatically when a connection URL carries no credentials.
    External,
}

impl Default for Auth {
    fn default() -> Auth {
        Auth::Plain {
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl Auth {
    pub(crate) fn from_userinfo(username: String, password: String) -> Auth {
        if username.is_empty() && password.is_empty() {
            Auth::External
        } else {
            Auth::Plain { username, password }
        }
    }
}

impl Sasl for Auth {
    fn mechanism(&self) -> String {
        match *self {
            Auth::Plain { .. } => "PLAIN".to_string(),
            Auth::External => "EXTERNAL".to_string(),
        }
    }

    fn response(&self) -> String {
        match self {
            Auth::Plain { username, password } => format!("\x00{}\x00{}", username, password),
            Auth::External => "".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_userinfo_selects_external() {
        assert_eq!(
            Auth::from_userinfo(String::new(), String::new()),
            Auth::External
        );
        assert_eq!(Auth::External.response(), "");
    }

    #[test]
    fn plain_response_is_null_delimited() {
        let auth = Auth::from_userinfo("guest".to_string(), "secret".to_string());
        assert_eq!(auth.mechanism(), "PLAIN");
        assert_eq!(auth.response(), "\x00guest\x00secret");
    }
}
