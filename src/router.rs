use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::auth::AccessPolicy;
use crate::storage;

/// Resolved upstream target for one relayed request.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub channel_id: String,
    pub channel_name: String,
    pub base_url: String,
    pub upstream_key: String,
    pub channel_proxy: Option<String>,
    pub actual_model: String,
    pub model_id: String,
    pub last_status: Option<bool>,
}

/// `"<channel>/<model>"` pins the channel by name; a bare model name matches
/// any enabled channel owning it.
pub fn parse_model_spec(spec: &str) -> (Option<&str>, &str) {
    match spec.split_once('/') {
        Some((prefix, model)) if !prefix.is_empty() && !model.is_empty() => (Some(prefix), model),
        _ => (None, spec),
    }
}

/// A channel credential may hold several upstream keys, split on newlines
/// and commas. The relay round-robins across them.
pub fn split_credentials(raw: &str) -> Vec<&str> {
    raw.split('\n')
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .collect()
}

/// Advisory round-robin cursor per channel. Nothing is persisted; the
/// counter restarts whenever the channel row is edited (its `updated_at`
/// changes) or the process restarts.
#[derive(Default)]
pub struct KeyCycler {
    cursors: Mutex<HashMap<String, (i64, u64)>>,
}

impl KeyCycler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self, channel_id: &str, channel_updated_at_ms: i64, key_count: usize) -> usize {
        if key_count <= 1 {
            return 0;
        }
        let mut cursors = self.cursors.lock().expect("key cycler lock");
        let entry = cursors.entry(channel_id.to_string()).or_insert((channel_updated_at_ms, 0));
        if entry.0 != channel_updated_at_ms {
            *entry = (channel_updated_at_ms, 0);
        }
        let index = (entry.1 as usize) % key_count;
        entry.1 = entry.1.wrapping_add(1);
        index
    }
}

/// First enabled channel owning the requested model (store order:
/// `sort_order` then name), restricted to what the key may reach. Identical
/// inputs always pick the same channel.
pub async fn resolve(
    db_path: PathBuf,
    cycler: &KeyCycler,
    policy: &AccessPolicy,
    model_spec: &str,
) -> anyhow::Result<Option<RouteTarget>> {
    let (channel_prefix, model_name) = parse_model_spec(model_spec);

    let candidates = storage::list_route_candidates(db_path, model_name.to_string()).await?;
    let chosen = candidates.into_iter().find(|c| {
        channel_prefix.is_none_or(|prefix| c.channel_name == prefix)
            && policy.permits(&c.channel_id, &c.model_id)
    });

    let Some(c) = chosen else {
        return Ok(None);
    };

    let keys = split_credentials(&c.api_key);
    let upstream_key = if keys.is_empty() {
        c.api_key.clone()
    } else {
        let index = cycler.next_index(&c.channel_id, c.channel_updated_at_ms, keys.len());
        keys[index].to_string()
    };

    Ok(Some(RouteTarget {
        channel_id: c.channel_id,
        channel_name: c.channel_name,
        base_url: c.base_url,
        upstream_key,
        channel_proxy: c.proxy_url,
        actual_model: c.model_name,
        model_id: c.model_id,
        last_status: c.last_status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_spec_parsing() {
        assert_eq!(parse_model_spec("gpt-4o"), (None, "gpt-4o"));
        assert_eq!(parse_model_spec("B/gpt-4o"), (Some("B"), "gpt-4o"));
        assert_eq!(parse_model_spec("/gpt-4o"), (None, "/gpt-4o"));
        // Only the first slash splits; the rest belongs to the model name.
        assert_eq!(
            parse_model_spec("open/gpt-4o/extra"),
            (Some("open"), "gpt-4o/extra")
        );
    }

    #[test]
    fn credential_splitting() {
        assert_eq!(split_credentials("sk-a"), vec!["sk-a"]);
        assert_eq!(split_credentials("sk-a,sk-b"), vec!["sk-a", "sk-b"]);
        assert_eq!(split_credentials("sk-a\nsk-b, sk-c\n"), vec!["sk-a", "sk-b", "sk-c"]);
        assert!(split_credentials(" \n ,").is_empty());
    }

    #[test]
    fn cycler_round_robins_and_resets_on_edit() {
        let cycler = KeyCycler::new();
        assert_eq!(cycler.next_index("c1", 100, 3), 0);
        assert_eq!(cycler.next_index("c1", 100, 3), 1);
        assert_eq!(cycler.next_index("c1", 100, 3), 2);
        assert_eq!(cycler.next_index("c1", 100, 3), 0);
        // Channel edited: cursor restarts.
        assert_eq!(cycler.next_index("c1", 200, 3), 0);
        // Single key short-circuits.
        assert_eq!(cycler.next_index("c2", 100, 1), 0);
    }
}
