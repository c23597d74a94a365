//! 上级代理认证：Basic 与 Digest（MD5 / MD5-sess，qop=auth）
use base64::{engine::general_purpose, Engine as _};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use tracing::debug;

/// Proxy-Authenticate 中的一个质询
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// 小写的认证方案名
    pub scheme: String,
    pub params: Vec<(String, String)>,
}

impl Challenge {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 在引号外按逗号切分
fn split_items(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&value[start..]);
    items
}

fn parse_param(item: &str) -> Option<(String, String)> {
    let (name, value) = item.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    let value = value.trim();
    let value = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(quoted) => {
            let mut out = String::with_capacity(quoted.len());
            let mut chars = quoted.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => value.to_string(),
    };
    Some((name.to_ascii_lowercase(), value))
}

/// 解析一个 Proxy-Authenticate 头部值中的全部质询
pub fn parse_challenges(value: &str) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();
    for item in split_items(value) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (head, rest) = match item.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (item, ""),
        };
        if !head.contains('=') {
            let mut challenge = Challenge {
                scheme: head.to_ascii_lowercase(),
                params: Vec::new(),
            };
            if let Some(param) = parse_param(rest) {
                challenge.params.push(param);
            }
            challenges.push(challenge);
        } else if let (Some(current), Some(param)) = (challenges.last_mut(), parse_param(item)) {
            current.params.push(param);
        }
    }
    challenges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
}

/// 可用于应答的 Digest 质询
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: DigestAlgorithm,
    /// 是否使用 qop=auth
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// 从通用质询中提取；不支持的算法或 qop 返回 `None`
    pub fn from_challenge(challenge: &Challenge) -> Option<Self> {
        if challenge.scheme != "digest" {
            return None;
        }
        let nonce = challenge.param("nonce")?.to_string();
        let algorithm = match challenge.param("algorithm") {
            None => DigestAlgorithm::Md5,
            Some(a) if a.eq_ignore_ascii_case("md5") => DigestAlgorithm::Md5,
            Some(a) if a.eq_ignore_ascii_case("md5-sess") => DigestAlgorithm::Md5Sess,
            Some(_) => return None,
        };
        let qop_auth = match challenge.param("qop") {
            None => false,
            Some(qop) => {
                if !qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    return None;
                }
                true
            }
        };
        Some(Self {
            realm: challenge.param("realm").unwrap_or_default().to_string(),
            nonce,
            opaque: challenge.param("opaque").map(str::to_string),
            algorithm,
            qop_auth,
        })
    }
}

fn md5_hex(data: &str) -> String {
    format!("{:x}", Md5::digest(data.as_bytes()))
}

/// 计算 Digest 的 response 值
pub fn digest_response(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    nc: &str,
    cnonce: &str,
) -> String {
    let mut ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    if challenge.algorithm == DigestAlgorithm::Md5Sess {
        ha1 = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, cnonce));
    }
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    if challenge.qop_auth {
        md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[derive(Debug)]
struct DigestState {
    challenge: DigestChallenge,
    nc: u32,
}

/// 上级代理凭据与最近一次 Digest 质询
///
/// 同一服务的所有会话共享一个实例：一次 407 学到的质询会被后续请求复用。
#[derive(Debug)]
pub struct ChainAuthenticator {
    username: String,
    password: String,
    digest: Mutex<Option<DigestState>>,
}

impl ChainAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            digest: Mutex::new(None),
        }
    }

    pub fn has_digest(&self) -> bool {
        self.digest.lock().is_some()
    }

    /// 生成 Proxy-Authorization 值：已缓存 Digest 质询时用 Digest，否则用 Basic
    pub fn authorization(&self, method: &str, uri: &str) -> String {
        let mut guard = self.digest.lock();
        let Some(state) = guard.as_mut() else {
            let credentials = format!("{}:{}", self.username, self.password);
            return format!("Basic {}", general_purpose::STANDARD.encode(credentials));
        };

        state.nc = state.nc.wrapping_add(1);
        let nc = format!("{:08x}", state.nc);
        let cnonce = format!("{:016x}", rand::random::<u64>());
        let challenge = &state.challenge;
        let response = digest_response(
            challenge,
            &self.username,
            &self.password,
            method,
            uri,
            &nc,
            &cnonce,
        );

        let mut header = format!(
            "Digest username={}, realm={}, nonce={}, uri={}, response={}",
            quote(&self.username),
            quote(&challenge.realm),
            quote(&challenge.nonce),
            quote(uri),
            quote(&response)
        );
        header.push_str(match challenge.algorithm {
            DigestAlgorithm::Md5 => ", algorithm=MD5",
            DigestAlgorithm::Md5Sess => ", algorithm=MD5-sess",
        });
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque={}", quote(opaque)));
        }
        if challenge.qop_auth {
            header.push_str(&format!(", qop=auth, nc={}, cnonce={}", nc, quote(&cnonce)));
        }
        header
    }

    /// 根据 407 中的质询更新状态，返回是否值得重试
    pub fn update<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> bool {
        let challenges: Vec<Challenge> = values.into_iter().flat_map(parse_challenges).collect();

        if let Some(digest) = challenges.iter().find_map(DigestChallenge::from_challenge) {
            debug!(realm = %digest.realm, algorithm = ?digest.algorithm, "cached digest challenge");
            *self.digest.lock() = Some(DigestState {
                challenge: digest,
                nc: 0,
            });
            return true;
        }
        if challenges.iter().any(|c| c.scheme == "basic") {
            *self.digest.lock() = None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenges() {
        let parsed = parse_challenges(
            r#"Basic realm="proxy", Digest realm="a, b", nonce="n\"1", qop="auth,auth-int", algorithm=MD5-sess"#,
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].scheme, "basic");
        assert_eq!(parsed[0].param("realm"), Some("proxy"));
        assert_eq!(parsed[1].scheme, "digest");
        assert_eq!(parsed[1].param("realm"), Some("a, b"));
        assert_eq!(parsed[1].param("nonce"), Some("n\"1"));

        let digest = DigestChallenge::from_challenge(&parsed[1]).unwrap();
        assert_eq!(digest.algorithm, DigestAlgorithm::Md5Sess);
        assert!(digest.qop_auth);
    }

    #[test]
    fn test_unsupported_digest() {
        let parsed = parse_challenges(r#"Digest realm="r", nonce="n", algorithm=SHA-256"#);
        assert!(DigestChallenge::from_challenge(&parsed[0]).is_none());

        let parsed = parse_challenges(r#"Digest realm="r", nonce="n", qop="auth-int""#);
        assert!(DigestChallenge::from_challenge(&parsed[0]).is_none());
    }

    #[test]
    fn test_rfc2617_digest_vector() {
        // RFC 2617 §3.5 示例
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".to_string()),
            algorithm: DigestAlgorithm::Md5,
            qop_auth: true,
        };
        let response = digest_response(
            &challenge,
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "00000001",
            "0a4f113b",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_basic_then_digest() {
        let auth = ChainAuthenticator::new("user", "pass");
        assert_eq!(auth.authorization("GET", "http://h/"), "Basic dXNlcjpwYXNz");

        assert!(auth.update([r#"Digest realm="r", nonce="abc", qop="auth", opaque="o""#]));
        assert!(auth.has_digest());
        let first = auth.authorization("GET", "http://h/");
        assert!(first.starts_with("Digest username=\"user\""));
        assert!(first.contains("nc=00000001"));
        assert!(first.contains("opaque=\"o\""));
        assert!(auth.authorization("GET", "http://h/").contains("nc=00000002"));

        assert!(auth.update(["Basic realm=\"r\""]));
        assert!(!auth.has_digest());
        assert!(!auth.update(["Negotiate"]));
    }
}
