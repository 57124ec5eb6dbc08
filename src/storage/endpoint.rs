use serde::{Deserialize, Serialize};

/// Upstream request shape used to talk to a provider. A single model is
/// probed on every endpoint kind its name qualifies for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointKind {
    Chat,
    Claude,
    Gemini,
    Codex,
    Image,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Chat => "CHAT",
            EndpointKind::Claude => "CLAUDE",
            EndpointKind::Gemini => "GEMINI",
            EndpointKind::Codex => "CODEX",
            EndpointKind::Image => "IMAGE",
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EndpointKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHAT" => Ok(EndpointKind::Chat),
            "CLAUDE" => Ok(EndpointKind::Claude),
            "GEMINI" => Ok(EndpointKind::Gemini),
            "CODEX" => Ok(EndpointKind::Codex),
            "IMAGE" => Ok(EndpointKind::Image),
            other => Err(anyhow::anyhow!("未知 endpoint：{other}")),
        }
    }
}

/// Chat completions is probed for every model; the extra endpoints are
/// picked from the model name (case-insensitive).
pub fn endpoints_for_model(model_name: &str) -> Vec<EndpointKind> {
    let name = model_name.to_ascii_lowercase();
    let mut out = vec![EndpointKind::Chat];

    if name.starts_with("claude") {
        out.push(EndpointKind::Claude);
    }
    if name.starts_with("gemini") {
        out.push(EndpointKind::Gemini);
    }
    if name.contains("gpt-4o") || name.contains("gpt-5") || is_o_series(&name) {
        out.push(EndpointKind::Codex);
    }

    out
}

// o1 / o3 / o4 model families: "o1", "o1-preview", "o3-mini", not "o2" or
// "olive".
fn is_o_series(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('o') else {
        return false;
    };
    let Some(digit) = rest.chars().next() else {
        return false;
    };
    if !matches!(digit, '1' | '3' | '4') {
        return false;
    }
    matches!(rest[1..].chars().next(), None | Some('-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_is_always_probed() {
        assert_eq!(endpoints_for_model("deepseek-chat"), vec![EndpointKind::Chat]);
    }

    #[test]
    fn claude_models_add_claude() {
        assert_eq!(
            endpoints_for_model("Claude-3-5-Sonnet"),
            vec![EndpointKind::Chat, EndpointKind::Claude]
        );
    }

    #[test]
    fn gemini_models_add_gemini() {
        assert_eq!(
            endpoints_for_model("gemini-2.0-flash"),
            vec![EndpointKind::Chat, EndpointKind::Gemini]
        );
    }

    #[test]
    fn responses_families_add_codex() {
        for name in ["gpt-4o", "gpt-4o-mini", "gpt-5-turbo", "o1", "o1-preview", "o3-mini", "o4-mini"] {
            assert!(
                endpoints_for_model(name).contains(&EndpointKind::Codex),
                "{name} should probe CODEX"
            );
        }
        for name in ["o2", "olive-1", "gpt-4-turbo", "o13"] {
            assert!(
                !endpoints_for_model(name).contains(&EndpointKind::Codex),
                "{name} should not probe CODEX"
            );
        }
    }
}
