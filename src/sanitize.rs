//! Message sanitizing
//!
//! Strips scripting and unsafe markup from user text before it is stored or
//! broadcast. Benign inline markup survives; `<script>`/`<style>` elements
//! are dropped together with their content, event-handler attributes and
//! unsafe URL schemes are removed.

/// HTML sanitizer applied to every decrypted message
#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer;

impl Sanitizer {
    pub fn new() -> Self {
        Self
    }

    pub fn sanitize(&self, text: &str) -> String {
        ammonia::clean(text)
    }

    /// Sanitize and report whether anything visible is left
    pub fn sanitize_non_empty(&self, text: &str) -> Option<String> {
        let clean = self.sanitize(text);
        if clean.trim().is_empty() {
            None
        } else {
            Some(clean)
        }
    }
}
