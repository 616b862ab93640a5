/// The single studio page. Static; everything dynamic comes from the JSON
/// routes it polls.
pub const INDEX_HTML: &str = r##"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Detection Studio</title>
<style>
  body {
    margin: 0;
    min-height: 100vh;
    font-family: system-ui, sans-serif;
    background: linear-gradient(135deg, #0f0f1a 0%, #1a0033 100%);
    color: #39ff14;
  }
  main { max-width: 960px; margin: 0 auto; padding: 2em 1em; }
  h1, h2 { color: #ff00ff; text-shadow: 0 0 10px #ff00ff; }
  h1 { text-align: center; font-size: 2em; }
  label { color: #00e5ff; font-weight: bold; }
  button {
    background: linear-gradient(90deg, #ff00ff, #39ff14);
    color: black;
    border: none;
    border-radius: 12px;
    font-weight: bold;
    padding: 0.6em 1.2em;
    margin-right: 0.6em;
    box-shadow: 0 0 10px #39ff14;
    cursor: pointer;
  }
  button:disabled { opacity: 0.4; cursor: default; }
  .row { margin: 1em 0; }
  #status { font-family: monospace; }
  #status.failed { color: #ff3860; }
  #preview { width: 100%; border: 1px solid #ff00ff; box-shadow: 0 0 10px #ff00ff; display: none; }
  #result { display: none; }
  a { color: #00e5ff; }
</style>
</head>
<body>
<main>
  <h1>Detection Studio</h1>
  <p>Upload a video or use the camera for live detection. Stop at any time and download what was processed.</p>

  <h2>Source</h2>
  <div class="row">
    <label for="file">Upload a video (mp4, avi, mov)</label><br>
    <input id="file" type="file" accept=".mp4,.avi,.mov,video/*">
  </div>
  <div class="row">
    <input id="camera" type="checkbox"> <label for="camera">Use camera (live detection)</label>
  </div>
  <div class="row">
    <label for="detector">Detector</label>
    <select id="detector"></select>
  </div>

  <div class="row">
    <button id="play">Play</button>
    <button id="stop" disabled>Stop</button>
  </div>
  <div class="row" id="status">idle</div>

  <img id="preview" alt="live preview">

  <div id="result">
    <h2>Result</h2>
    <video id="player" controls width="100%"></video>
    <p><a id="download" href="/output" download="output.avi">Download processed video</a></p>
  </div>
</main>
<script>
const $ = (id) => document.getElementById(id);
let uploaded = null;
let polling = null;

async function loadDetectors() {
  const res = await fetch('/detectors');
  const body = await res.json();
  for (const name of body.detectors) {
    const opt = document.createElement('option');
    opt.value = name;
    opt.textContent = name;
    opt.selected = name === body.default;
    $('detector').appendChild(opt);
  }
}

async function upload(file) {
  $('status').textContent = 'uploading ' + file.name + '...';
  const res = await fetch('/upload?name=' + encodeURIComponent(file.name), { method: 'POST', body: file });
  const body = await res.json();
  if (!res.ok) throw new Error(body.message || body.error);
  uploaded = file;
}

async function play() {
  try {
    const file = $('file').files[0];
    if (file && file !== uploaded && !$('camera').checked) await upload(file);
    const params = new URLSearchParams({ camera: $('camera').checked, detector: $('detector').value });
    const res = await fetch('/start?' + params, { method: 'POST' });
    const body = await res.json();
    if (!res.ok) throw new Error(body.message || body.error);
    $('result').style.display = 'none';
    $('preview').style.display = 'block';
    if (!polling) polling = setInterval(poll, 400);
  } catch (err) {
    showStatus('error: ' + err.message, true);
  }
}

async function stop() {
  await fetch('/stop', { method: 'POST' });
}

function showStatus(text, failed) {
  $('status').textContent = text;
  $('status').className = failed ? 'failed' : '';
}

async function poll() {
  const status = await (await fetch('/status')).json();
  const running = status.state === 'RUNNING';
  $('play').disabled = running;
  $('stop').disabled = !running;
  if (running) {
    showStatus('running: ' + status.frames + ' frames (' + (status.detector || '') + ')', false);
    $('preview').src = '/preview.jpg?seq=' + status.frames;
    return;
  }
  clearInterval(polling);
  polling = null;
  showStatus(status.message || status.state.toLowerCase(), status.state === 'FAILED');
  if (status.artifact_offered) {
    $('player').src = '/output?t=' + Date.now();
    $('result').style.display = 'block';
  }
}

$('play').addEventListener('click', play);
$('stop').addEventListener('click', stop);
loadDetectors();
poll();
</script>
</body>
</html>
"##;
