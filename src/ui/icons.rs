//! Shared status icons with plain-text fallbacks.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static FILE_NEW: Emoji<'_, '_> = Emoji("📄 ", "+");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");
pub static PENDING: Emoji<'_, '_> = Emoji("⏳ ", "[ ]");
