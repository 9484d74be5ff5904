//! The manifest renderer: a pure function from a sanitized parameter record
//! to the marketplace's SDL v2.0 deployment descriptor.

/// The container's management-plane port; the only port exposed externally.
const CONTAINER_PORT: u16 = 18789;
const EXTERNAL_PORT: u16 = 80;

pub struct ManifestParams<'a> {
  pub channel_token: &'a str,
  pub internal_api_key: &'a str,
  pub upstream_api_key: &'a str,
  pub model_id: &'a str,
  pub ibc_denom: &'a str,
}

/// Removes newline, carriage-return, and NUL, then escapes backslash and
/// double-quote so the value is safe inside a YAML double-quoted string.
/// The only security-relevant step in this module.
fn sanitize(value: &str) -> String {
  value
    .chars()
    .filter(|c| *c != '\n' && *c != '\r' && *c != '\0')
    .collect::<String>()
    .replace('\\', "\\\\")
    .replace('"', "\\\"")
}

/// Renders the fixed SDL v2.0 template with the five sanitized variables
/// interpolated. Never fails: sanitization is total over any `&str` input.
pub fn render(params: &ManifestParams) -> String {
  let channel_token = sanitize(params.channel_token);
  let internal_api_key = sanitize(params.internal_api_key);
  let upstream_api_key = sanitize(params.upstream_api_key);
  let model_id = sanitize(params.model_id);
  let ibc_denom = sanitize(params.ibc_denom);

  format!(
    r#"---
version: "2.0"
services:
  openclaw:
    image: ghcr.io/openclaw/bot-runtime:latest
    env:
      - MODEL_ID="{model_id}"
      - BASE_URL="https://api.openclaw.dev/v1"
      - API_KEY="{upstream_api_key}"
      - TELEGRAM_BOT_TOKEN="{channel_token}"
      - TELEGRAM_ENABLED=true
      - OPENCLAW_GATEWAY_TOKEN="{internal_api_key}"
    expose:
      - port: {container_port}
        as: {external_port}
        to:
          - global: true
    params:
      storage:
        data:
          mount: /data
          readOnly: false
profiles:
  compute:
    openclaw:
      resources:
        cpu:
          units: 1.5
        memory:
          size: 3Gi
        storage:
          - size: 2Gi
          - name: data
            size: 10Gi
            attributes:
              persistent: true
  placement:
    akash:
      pricing:
        openclaw:
          denom: "{ibc_denom}"
          amount: 1
deployment:
  openclaw:
    akash:
      profile: openclaw
      count: 1
"#,
    model_id = model_id,
    upstream_api_key = upstream_api_key,
    channel_token = channel_token,
    internal_api_key = internal_api_key,
    container_port = CONTAINER_PORT,
    external_port = EXTERNAL_PORT,
    ibc_denom = ibc_denom,
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sanitizes_newlines_and_quotes_from_every_variable() {
    let params = ManifestParams {
      channel_token: "line1\nline2\r\nTELEGRAM_BOT_TOKEN=\"hijacked\"",
      internal_api_key: "key\0withnul",
      upstream_api_key: "backslash\\value",
      model_id: "gpt\"; rm -rf /",
      ibc_denom: "ibc/ABCD",
    };
    let rendered = render(&params);
    assert!(!rendered.contains("line1\nline2"));
    assert!(!rendered.contains('\0'));
    assert!(rendered.contains("hijacked\\\""));
    assert!(rendered.contains("backslash\\\\value"));
  }

  #[test]
  fn declares_the_fixed_shape() {
    let params = ManifestParams {
      channel_token: "t",
      internal_api_key: "k",
      upstream_api_key: "u",
      model_id: "gpt-4o-mini",
      ibc_denom: "ibc/XYZ",
    };
    let rendered = render(&params);
    assert!(rendered.contains("MODEL_ID=\"gpt-4o-mini\""));
    assert!(rendered.contains("TELEGRAM_ENABLED=true"));
    assert!(rendered.contains("as: 80"));
    assert!(rendered.contains("port: 18789"));
    assert!(rendered.contains("denom: \"ibc/XYZ\""));
  }
}
