//! Shared UI icons.
//!
//! Each icon falls back to a plain ASCII marker on terminals without
//! emoji support.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static REUSED: Emoji<'_, '_> = Emoji("♻️  ", "[=]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Run indicators
pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[W]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static HINT: Emoji<'_, '_> = Emoji("💡 ", "hint:");
pub static WATCH: Emoji<'_, '_> = Emoji("👀 ", "[WATCH]");
