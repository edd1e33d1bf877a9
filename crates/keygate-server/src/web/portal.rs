// crates/keygate-server/src/web/portal.rs
// Embedded HTML dashboard

use axum::response::Html;

/// `GET /portal` — a single self-contained page that polls `/portal/api`.
pub async fn page() -> Html<&'static str> {
    Html(PORTAL_HTML)
}

const PORTAL_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Keygate</title>
<style>
  body { font-family: ui-monospace, SFMono-Regular, Menlo, monospace; margin: 2rem; background: #101418; color: #d8dee4; }
  h1 { font-size: 1.2rem; }
  h2 { font-size: 0.95rem; margin-top: 1.5rem; color: #8fa1b3; }
  table { border-collapse: collapse; width: 100%; font-size: 0.85rem; }
  th, td { text-align: left; padding: 0.25rem 0.75rem 0.25rem 0; border-bottom: 1px solid #222933; }
  th { color: #8fa1b3; font-weight: normal; }
  .ok { color: #9ece6a; }
  .err { color: #f7768e; }
  #status { font-size: 0.85rem; }
</style>
</head>
<body>
<h1>keygate</h1>
<div id="status">loading…</div>
<h2>usage buckets</h2>
<table id="buckets"><thead><tr>
  <th>agent</th><th>campaign</th><th>calls</th><th>errors</th><th>in tokens</th><th>out tokens</th><th>last seen</th>
</tr></thead><tbody></tbody></table>
<h2>recent audit entries</h2>
<table id="audit"><thead><tr>
  <th>time</th><th>caller</th><th>action</th><th>query</th><th>source</th><th>allowed</th>
</tr></thead><tbody></tbody></table>
<script>
async function refresh() {
  try {
    const res = await fetch('/portal/api');
    const data = await res.json();
    document.getElementById('status').textContent =
      `proxy: ${data.proxy} · tool calls: ${data.total_calls} · webhook events: ${data.webhook_total}`;

    const buckets = document.querySelector('#buckets tbody');
    buckets.innerHTML = '';
    for (const b of data.buckets) {
      const row = buckets.insertRow();
      for (const v of [b.agent || 'unknown', b.campaign_id, b.tool_calls, b.error_count,
                       b.input_tokens, b.output_tokens, b.last_seen]) {
        row.insertCell().textContent = v;
      }
    }

    const audit = document.querySelector('#audit tbody');
    audit.innerHTML = '';
    for (const e of data.audit) {
      const row = audit.insertRow();
      for (const v of [e.timestamp, e.caller.login || e.caller.node, e.action, e.query, e.source]) {
        row.insertCell().textContent = v;
      }
      const allowed = row.insertCell();
      allowed.textContent = e.allowed ? 'yes' : 'no';
      allowed.className = e.allowed ? 'ok' : 'err';
    }
  } catch (err) {
    document.getElementById('status').textContent = 'unreachable: ' + err;
  }
}
refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>
"#;
