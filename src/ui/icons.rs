//! Emoji used across the terminal output, with plain-text fallbacks.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[PAUSE]");
pub static CHALLENGE: Emoji<'_, '_> = Emoji("⚔️  ", "[CHAL]");
pub static QUESTION: Emoji<'_, '_> = Emoji("❓ ", "[?]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[W]");
pub static MERGE: Emoji<'_, '_> = Emoji("🔀 ", "[M]");
pub static WRENCH: Emoji<'_, '_> = Emoji("🔧 ", "[FIX]");
pub static GAUGE: Emoji<'_, '_> = Emoji("📊 ", "[CONF]");
