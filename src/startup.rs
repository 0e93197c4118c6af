//! Process-wide editor environment registration
//!
//! One-time startup state with a single init and no teardown, installed
//! before any session exists and fully decoupled from the bridge
//! lifecycle.

use std::sync::OnceLock;

static LANGUAGES: OnceLock<Vec<LanguageRegistration>> = OnceLock::new();

/// A language the editor environment should recognize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageRegistration {
    pub id: String,
    pub extensions: Vec<String>,
    pub aliases: Vec<String>,
}

impl LanguageRegistration {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extensions: Vec::new(),
            aliases: Vec::new(),
        }
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(ToString::to_string).collect();
        self
    }
}

/// Install the language registrations exactly once.
///
/// Returns `false` if a registration was already installed; the
/// existing one is kept.
pub fn register_languages(languages: Vec<LanguageRegistration>) -> bool {
    LANGUAGES.set(languages).is_ok()
}

/// The installed registrations, empty before `register_languages`
pub fn registered_languages() -> &'static [LanguageRegistration] {
    LANGUAGES.get().map(Vec::as_slice).unwrap_or(&[])
}

/// Stock registration for Terraform/HCL documents
pub fn terraform() -> LanguageRegistration {
    LanguageRegistration::new("terraform")
        .with_extensions(&[".tf", ".tfvars"])
        .with_aliases(&["Terraform", "terraform", "tf", "HCL", "hcl"])
}
