//! Decryption of CENC-encrypted fMP4 segments via an external decrypt
//! binary (`mp4decrypt`-shaped CLI contract): stdin/stdout streaming as the
//! primary path, with a temporary-file fallback for tools that don't accept
//! `-` as a file argument.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{ConverterError, Result};
use crate::manifest::normalize_kid;

const MIN_PAYLOAD_LEN: usize = 8;
/// Only the first few KB of a failing subprocess's stdout/stderr are worth
/// keeping in an error.
const MAX_CAPTURED_OUTPUT: usize = 4096;

fn truncated(bytes: &[u8]) -> String {
    let len = bytes.len().min(MAX_CAPTURED_OUTPUT);
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Outcome of a failed stdin/stdout decrypt attempt: either the tool rejected
/// `-` as a file argument (worth retrying against real files), or it ran and
/// genuinely failed to decrypt (a retry would not help).
enum StdioFailure {
    ArgumentRejected(ConverterError),
    Other(ConverterError),
}

/// Heuristic for whether a failing tool's stderr indicates it doesn't accept
/// `-` as a stand-in filename, as opposed to a real decryption error (bad
/// key, corrupt input, unsupported encryption scheme). Tools that reject `-`
/// typically complain about being unable to open it as a file or about
/// invalid arguments; a genuine decrypt failure talks about the content
/// instead.
fn rejects_dash_argument(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    let complains_about_opening_dash = lower.contains('-')
        && (lower.contains("cannot open")
            || lower.contains("can't open")
            || lower.contains("could not open")
            || lower.contains("unable to open")
            || lower.contains("no such file"));
    let complains_about_usage =
        lower.contains("usage:") || lower.contains("invalid argument") || lower.contains("invalid option");
    complains_about_opening_dash || complains_about_usage
}

/// Resolve a commandline tool to a usable path: absolute/relative paths with
/// a separator are checked directly, bare names are searched for on `PATH`.
fn resolve_tool(tool: &str) -> Option<PathBuf> {
    let path = Path::new(tool);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

fn normalize_key(key: &str) -> Result<String> {
    let mut key = key.trim().to_lowercase();
    if let Some(stripped) = key.strip_prefix("0x") {
        key = stripped.to_string();
    }
    if key.len() != 32 && key.len() != 64 {
        return Err(ConverterError::Configuration(
            "keys must be 16 or 32 bytes expressed in hexadecimal characters".to_string(),
        ));
    }
    Ok(key)
}

/// Polymorphic decryptor: either passes segments through untouched, or
/// shells out to an external CENC decrypt binary per segment.
pub enum Decryptor {
    Passthrough,
    ExternalCenc(ExternalCencDecryptor),
}

impl Decryptor {
    /// Build the decryptor variant implied by a stream's key configuration.
    /// `key`/`kid` and `key_map` are mutually alternative; no key material
    /// at all yields `Passthrough`.
    pub fn build(
        key: Option<&str>,
        kid: Option<&str>,
        key_map: Option<&HashMap<String, String>>,
        tool_path: Option<&str>,
    ) -> Result<Self> {
        let resolved_map: HashMap<String, String> = if let Some(map) = key_map {
            map.clone()
        } else if let Some(key) = key {
            let kid = kid.ok_or_else(|| {
                ConverterError::Configuration("a KID must be provided alongside a key".to_string())
            })?;
            HashMap::from([(kid.to_string(), key.to_string())])
        } else {
            return Ok(Decryptor::Passthrough);
        };

        Ok(Decryptor::ExternalCenc(ExternalCencDecryptor::new(
            resolved_map,
            tool_path.unwrap_or("mp4decrypt"),
        )?))
    }

    pub async fn decrypt(&self, payload: &[u8], kid: Option<&str>) -> Result<Vec<u8>> {
        match self {
            Decryptor::Passthrough => Ok(payload.to_vec()),
            Decryptor::ExternalCenc(d) => d.decrypt(payload, kid).await,
        }
    }
}

/// Decrypts segments by invoking an external CENC tool (`mp4decrypt`'s CLI
/// contract: `--key <kid>:<key> <in> <out>`, with `-`/`-` meaning
/// stdin/stdout).
pub struct ExternalCencDecryptor {
    key_map: HashMap<String, String>,
    tool_path: String,
}

impl ExternalCencDecryptor {
    pub fn new(key_map: HashMap<String, String>, tool_path: &str) -> Result<Self> {
        if key_map.is_empty() {
            return Err(ConverterError::Configuration("key_map must contain at least one entry".to_string()));
        }
        let normalized = key_map
            .into_iter()
            .map(|(k, v)| Ok((normalize_kid(&k), normalize_key(&v)?)))
            .collect::<Result<HashMap<String, String>>>()?;

        if resolve_tool(tool_path).is_none() {
            return Err(ConverterError::Configuration(format!(
                "could not find '{tool_path}' in PATH; install Bento4 or provide the full path"
            )));
        }

        Ok(ExternalCencDecryptor { key_map: normalized, tool_path: tool_path.to_string() })
    }

    fn resolve_key<'a>(&'a self, kid: Option<&str>) -> Result<(&'a str, &'a str)> {
        if let Some(kid) = kid {
            let normalized = normalize_kid(kid);
            if let Some(key) = self.key_map.get(&normalized) {
                return Ok((self.key_map.keys().find(|k| *k == &normalized).unwrap().as_str(), key.as_str()));
            }
            if self.key_map.len() == 1 {
                let (k, v) = self.key_map.iter().next().unwrap();
                return Ok((k.as_str(), v.as_str()));
            }
            return Err(ConverterError::Decrypting(format!("no key registered for KID {normalized}")));
        }
        if self.key_map.len() == 1 {
            let (k, v) = self.key_map.iter().next().unwrap();
            return Ok((k.as_str(), v.as_str()));
        }
        Err(ConverterError::Decrypting("no KID supplied and multiple keys registered".to_string()))
    }

    pub async fn decrypt(&self, payload: &[u8], kid: Option<&str>) -> Result<Vec<u8>> {
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(ConverterError::Decrypting(format!(
                "payload too short to be a valid fMP4 segment ({} bytes)",
                payload.len()
            )));
        }
        let (kid, key) = self.resolve_key(kid)?;
        let key_binding = format!("{kid}:{key}");

        match self.decrypt_stdio(&key_binding, payload).await {
            Ok(out) => Ok(out),
            Err(StdioFailure::ArgumentRejected(err)) => {
                warn!("decrypt tool rejected piped stdin/stdout, retrying via temp files: {err}");
                self.decrypt_tempfiles(&key_binding, payload).await
            }
            Err(StdioFailure::Other(err)) => Err(err),
        }
    }

    async fn decrypt_stdio(&self, key_binding: &str, payload: &[u8]) -> std::result::Result<Vec<u8>, StdioFailure> {
        let mut child = Command::new(&self.tool_path)
            .args(["--key", key_binding, "-", "-"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| StdioFailure::Other(ConverterError::io(e, "spawning decrypt tool")))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let payload = payload.to_vec();
        let write_task = tokio::spawn(async move {
            let res = stdin.write_all(&payload).await;
            drop(stdin);
            res
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout)
                .await
                .map_err(|e| StdioFailure::Other(ConverterError::io(e, "reading decrypt stdout")))?;
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_end(&mut stderr)
                .await
                .map_err(|e| StdioFailure::Other(ConverterError::io(e, "reading decrypt stderr")))?;
        }
        let _ = write_task.await;
        let status = child
            .wait()
            .await
            .map_err(|e| StdioFailure::Other(ConverterError::io(e, "waiting for decrypt tool")))?;

        if !status.success() {
            let stderr_text = truncated(&stderr);
            let err = ConverterError::Decrypting(format!(
                "decrypt tool exited with {status} (input prefix {}): stdout={} stderr={}",
                hex_prefix(&payload),
                truncated(&stdout),
                stderr_text,
            ));
            return Err(if rejects_dash_argument(&stderr_text) {
                StdioFailure::ArgumentRejected(err)
            } else {
                StdioFailure::Other(err)
            });
        }
        if stdout.is_empty() {
            // A clean exit with nothing on stdout is not how a tool signals
            // "I don't support piping" — that is a genuine decrypt failure.
            return Err(StdioFailure::Other(ConverterError::Decrypting(format!(
                "decrypt tool produced no output: stderr={}",
                truncated(&stderr)
            ))));
        }
        Ok(stdout)
    }

    async fn decrypt_tempfiles(&self, key_binding: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut infile = tempfile::Builder::new()
            .prefix("dash2hls-in-")
            .suffix(".mp4")
            .tempfile()
            .map_err(|e| ConverterError::io(e, "creating temp input file"))?;
        infile.write_all(payload).map_err(|e| ConverterError::io(e, "writing temp input file"))?;
        let outfile = tempfile::Builder::new()
            .prefix("dash2hls-out-")
            .suffix(".mp4")
            .tempfile()
            .map_err(|e| ConverterError::io(e, "creating temp output file"))?;

        let in_path = infile.path().to_owned();
        let out_path = outfile.path().to_owned();

        info!("retrying decrypt via temp files {} -> {}", in_path.display(), out_path.display());

        let output = Command::new(&self.tool_path)
            .args(["--key", key_binding, &in_path.to_string_lossy(), &out_path.to_string_lossy()])
            .output()
            .await
            .map_err(|e| ConverterError::io(e, "spawning decrypt tool (file mode)"))?;

        if !output.status.success() {
            return Err(ConverterError::Decrypting(format!(
                "decrypt tool (file mode) exited with {}: stdout={} stderr={}",
                output.status,
                truncated(&output.stdout),
                truncated(&output.stderr),
            )));
        }

        let result = tokio::fs::read(&out_path).await.map_err(|e| ConverterError::io(e, "reading decrypted temp file"))?;
        if result.is_empty() {
            return Err(ConverterError::Decrypting("decrypt tool (file mode) produced an empty file".to_string()));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_key_accepts_16_and_32_byte_hex() {
        assert_eq!(normalize_key("0x00112233445566778899AABBCCDDEEFF").unwrap().len(), 32);
        assert_eq!(normalize_key(&"ab".repeat(32)).unwrap().len(), 64);
    }

    #[test]
    fn normalize_key_rejects_bad_length() {
        assert!(normalize_key("deadbeef").is_err());
    }

    #[test]
    fn dash_argument_rejection_detected_from_stderr() {
        assert!(rejects_dash_argument("error: cannot open '-' for reading"));
        assert!(rejects_dash_argument("Usage: mp4decrypt [options] <input> <output>"));
        assert!(rejects_dash_argument("invalid argument: -"));
    }

    #[test]
    fn genuine_decrypt_failure_not_mistaken_for_argument_rejection() {
        assert!(!rejects_dash_argument("error: decryption failed, incorrect key"));
        assert!(!rejects_dash_argument("Error: track is encrypted with an unsupported scheme"));
    }

    #[tokio::test]
    async fn passthrough_returns_input_unchanged() {
        let d = Decryptor::Passthrough;
        let out = d.decrypt(b"hello world", None).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn build_with_no_keys_is_passthrough() {
        let d = Decryptor::build(None, None, None, None).unwrap();
        assert!(matches!(d, Decryptor::Passthrough));
    }

    #[test]
    fn build_with_key_but_no_kid_fails() {
        let err = Decryptor::build(Some(&"ab".repeat(16)), None, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn single_key_resolves_regardless_of_requested_kid() {
        let map = HashMap::from([("abcdef".to_string(), "00".repeat(16))]);
        let d = ExternalCencDecryptor {
            key_map: map.into_iter().map(|(k, v)| (k, v)).collect(),
            tool_path: "mp4decrypt".to_string(),
        };
        let (kid_a, key_a) = d.resolve_key(Some("nonexistent")).unwrap();
        let (kid_b, key_b) = d.resolve_key(None).unwrap();
        assert_eq!(kid_a, "abcdef");
        assert_eq!(kid_b, "abcdef");
        assert_eq!(key_a, key_b);
    }
}
