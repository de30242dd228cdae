//! Browser auto-trigger script.

use serde::Deserialize;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Query string of `GET /cron/auto-trigger.js`. Unset fields fall back to defaults.
///
/// `token` is echoed into the script as a bearer token for gateways that
/// require one; the caller must already know it.
#[derive(Debug, Default, Deserialize)]
pub struct AutoTriggerQuery {
    pub interval: Option<u64>,
    pub debug: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<u64>,
    pub token: Option<String>,
}

impl AutoTriggerQuery {
    pub fn resolve(&self, default_interval_ms: u64) -> ScriptOptions {
        ScriptOptions {
            interval_ms: self.interval.unwrap_or(default_interval_ms).max(1_000),
            debug: self.debug.unwrap_or(false),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay_ms: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            token: self.token.clone().filter(|t| !t.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOptions {
    pub interval_ms: u64,
    pub debug: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub token: Option<String>,
}

const TEMPLATE: &str = r#"(function () {
  var url = "__URL__";
  var interval = __INTERVAL__;
  var maxRetries = __MAX_RETRIES__;
  var retryDelay = __RETRY_DELAY__;
  var debug = __DEBUG__;
  var token = __TOKEN__;

  function log(message) {
    if (debug) {
      console.log("[cron] " + message);
    }
  }

  function trigger(attempt) {
    var headers = { "Accept": "application/json" };
    if (token) {
      headers["Authorization"] = "Bearer " + token;
    }
    fetch(url, { method: "POST", headers: headers })
      .then(function (res) {
        if (!res.ok) {
          throw new Error("HTTP " + res.status);
        }
        return res.json();
      })
      .then(function (body) {
        log(body.message);
      })
      .catch(function (err) {
        log("trigger failed: " + err.message);
        if (attempt < maxRetries) {
          setTimeout(function () { trigger(attempt + 1); }, retryDelay);
        }
      });
  }

  setTimeout(function () {
    trigger(0);
    setInterval(function () { trigger(0); }, interval);
  }, 1000);
})();
"#;

/// Render the poller script targeting `trigger_url`.
pub fn render_script(options: &ScriptOptions, trigger_url: &str) -> String {
    TEMPLATE
        .replace("__URL__", &trigger_url.replace('"', "\\\""))
        .replace("__INTERVAL__", &options.interval_ms.to_string())
        .replace("__MAX_RETRIES__", &options.max_retries.to_string())
        .replace("__RETRY_DELAY__", &options.retry_delay_ms.to_string())
        .replace("__DEBUG__", if options.debug { "true" } else { "false" })
        .replace("__TOKEN__", &token_literal(options.token.as_deref()))
}

/// JavaScript literal for the bearer token, `null` when unset.
fn token_literal(token: Option<&str>) -> String {
    match token {
        Some(token) => serde_json::to_string(token)
            .unwrap_or_else(|_| "null".to_string())
            .replace('<', "\\u003c"),
        None => "null".to_string(),
    }
}
