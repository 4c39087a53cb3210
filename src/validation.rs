use std::collections::BTreeMap;
use std::fmt;

/// Minimum password length accepted by the login and registration forms.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Per-field validation messages, keyed by form field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: BTreeMap<&'static str, String>,
}

impl ValidationErrors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Message for a single field, if it failed.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub(crate) fn check(&mut self, field: &'static str, result: Result<(), String>) {
        if let Err(message) = result {
            self.fields.insert(field, message);
        }
    }

    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.fields {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{field}: {message}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Validates an email address format.
///
/// Accepts `local@domain.tld`:
/// - No whitespace anywhere
/// - Exactly one `@`, with a non-empty local part
/// - A `.` inside the domain with characters on both sides
#[must_use]
pub fn is_valid_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

/// Checks the email field the way the login form does.
///
/// # Errors
///
/// Returns the message to show next to the field.
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.trim().is_empty() {
        Err("Email is required".into())
    } else if !is_valid_email(email) {
        Err("Invalid email format".into())
    } else {
        Ok(())
    }
}

/// Checks the password field the way the login form does.
///
/// # Errors
///
/// Returns the message to show next to the field.
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.trim().is_empty() {
        Err("Password is required".into())
    } else if password.chars().count() < MIN_PASSWORD_LEN {
        Err(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        ))
    } else {
        Ok(())
    }
}

/// Checks a required free-text field.
///
/// # Errors
///
/// Returns the message to show next to the field.
pub fn validate_required(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err("This field is required".into())
    } else {
        Ok(())
    }
}
