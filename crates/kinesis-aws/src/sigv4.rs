//! AWS Signature Version 4 for the two request shapes this crate makes:
//! signed JSON POSTs to the control plane and presigned websocket URLs for
//! the signaling data plane.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use url::Url;

use kinesis_webrtc::{Credentials, ServiceError};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SERVICE: &str = "kinesisvideo";
/// Presigned signaling URLs stay valid just under five minutes.
pub const PRESIGN_EXPIRES_SECS: u32 = 299;

/// RFC 3986 unreserved characters pass through; everything else is encoded.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct SigningParams<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

impl<'a> SigningParams<'a> {
    /// Signing time is wall clock corrected by the offset the service
    /// reported through its `Date` header.
    pub fn now(credentials: &'a Credentials, region: &'a str, clock_offset_ms: i64) -> Self {
        Self {
            credentials,
            region,
            service: SERVICE,
            time: Utc::now() + Duration::milliseconds(clock_offset_ms),
        }
    }

    fn amz_date(&self) -> String {
        self.time.format("%Y%m%dT%H%M%SZ").to_string()
    }

    fn date_stamp(&self) -> String {
        self.time.format("%Y%m%d").to_string()
    }

    fn scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            self.date_stamp(),
            self.region,
            self.service
        )
    }
}

/// Headers to attach to a signed request, `authorization` last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub amz_date: String,
    pub security_token: Option<String>,
    pub authorization: String,
}

pub fn hash_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, ServiceError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|err| ServiceError::Signing(err.to_string()))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn signing_key(
    secret_access_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, ServiceError> {
    let date = hmac_sha256(format!("AWS4{secret_access_key}").as_bytes(), date_stamp)?;
    let region = hmac_sha256(&date, region)?;
    let service = hmac_sha256(&region, service)?;
    hmac_sha256(&service, "aws4_request")
}

pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(pairs: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(key, value)| (uri_encode(key), uri_encode(value)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn host_header(url: &Url) -> Result<String, ServiceError> {
    let host = url
        .host_str()
        .ok_or_else(|| ServiceError::Signing(format!("{url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn signature(
    params: &SigningParams<'_>,
    canonical_request: &str,
) -> Result<String, ServiceError> {
    let string_to_sign = format!(
        "{ALGORITHM}\n{}\n{}\n{}",
        params.amz_date(),
        params.scope(),
        hash_hex(canonical_request.as_bytes())
    );
    let key = signing_key(
        &params.credentials.secret_access_key,
        &params.date_stamp(),
        params.region,
        params.service,
    )?;
    Ok(hex::encode(hmac_sha256(&key, &string_to_sign)?))
}

/// Signs a request whose headers are `host`, `x-amz-date`, the optional
/// session token and `extra_headers`.
pub fn sign_request(
    method: &str,
    url: &Url,
    extra_headers: &[(&str, &str)],
    payload: &[u8],
    params: &SigningParams<'_>,
) -> Result<SignedHeaders, ServiceError> {
    let amz_date = params.amz_date();
    let security_token = params.credentials.session_token.clone();

    let mut headers: Vec<(String, String)> = vec![
        ("host".into(), host_header(url)?),
        ("x-amz-date".into(), amz_date.clone()),
    ];
    if let Some(token) = &security_token {
        headers.push(("x-amz-security-token".into(), token.clone()));
    }
    headers.extend(
        extra_headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string())),
    );
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();

    let canonical_request = format!(
        "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{}",
        canonical_uri(url),
        canonical_query(&query),
        hash_hex(payload)
    );
    let signature = signature(params, &canonical_request)?;

    Ok(SignedHeaders {
        amz_date,
        security_token,
        authorization: format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={signed_headers}, Signature={signature}",
            params.credentials.access_key_id,
            params.scope()
        ),
    })
}

/// Presigns a websocket endpoint. `query` carries the channel parameters
/// (`X-Amz-ChannelARN`, and `X-Amz-ClientId` for viewers); the auth
/// parameters are added here.
pub fn presign_url(
    endpoint: &str,
    query: &[(&str, &str)],
    params: &SigningParams<'_>,
) -> Result<Url, ServiceError> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| ServiceError::Signing(format!("invalid endpoint {endpoint}: {err}")))?;
    if url.path().is_empty() {
        url.set_path("/");
    }
    let host = host_header(&url)?;

    let mut pairs: Vec<(String, String)> = vec![
        ("X-Amz-Algorithm".into(), ALGORITHM.into()),
        (
            "X-Amz-Credential".into(),
            format!("{}/{}", params.credentials.access_key_id, params.scope()),
        ),
        ("X-Amz-Date".into(), params.amz_date()),
        ("X-Amz-Expires".into(), PRESIGN_EXPIRES_SECS.to_string()),
        ("X-Amz-SignedHeaders".into(), "host".into()),
    ];
    if let Some(token) = &params.credentials.session_token {
        pairs.push(("X-Amz-Security-Token".into(), token.clone()));
    }
    pairs.extend(
        query
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string())),
    );

    let query = canonical_query(&pairs);
    let canonical_request = format!(
        "GET\n{}\n{query}\nhost:{host}\n\nhost\n{}",
        canonical_uri(&url),
        hash_hex(b"")
    );
    let signature = signature(params, &canonical_request)?;

    url.set_query(Some(&format!("{query}&X-Amz-Signature={signature}")));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, TimeZone};

    fn at(stamp: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%SZ").expect("valid timestamp");
        Utc.from_utc_datetime(&naive)
    }

    #[test]
    fn derives_documented_signing_key() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .expect("key");
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn signs_get_vanilla() {
        let credentials = Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY");
        let params = SigningParams {
            credentials: &credentials,
            region: "us-east-1",
            service: "service",
            time: at("20150830T123600Z"),
        };
        let url = Url::parse("https://example.amazonaws.com/").expect("url");
        let signed = sign_request("GET", &url, &[], b"", &params).expect("signed");
        assert_eq!(signed.amz_date, "20150830T123600Z");
        assert_eq!(
            signed.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn session_token_is_a_signed_header() {
        let credentials = Credentials::new("AKID", "secret").with_session_token("token");
        let params = SigningParams {
            credentials: &credentials,
            region: "us-west-2",
            service: SERVICE,
            time: at("20240101T000000Z"),
        };
        let url = Url::parse("https://kinesisvideo.us-west-2.amazonaws.com/getSignalingChannelEndpoint")
            .expect("url");
        let signed = sign_request(
            "POST",
            &url,
            &[("Content-Type", "application/json")],
            b"{}",
            &params,
        )
        .expect("signed");
        assert_eq!(signed.security_token.as_deref(), Some("token"));
        assert!(signed
            .authorization
            .contains("SignedHeaders=content-type;host;x-amz-date;x-amz-security-token,"));
    }

    #[test]
    fn presigned_url_carries_sorted_auth_parameters() {
        let credentials = Credentials::new("AKID", "secret").with_session_token("tok/en");
        let params = SigningParams {
            credentials: &credentials,
            region: "us-west-2",
            service: SERVICE,
            time: at("20240101T000000Z"),
        };
        let url = presign_url(
            "wss://v-1234.kinesisvideo.us-west-2.amazonaws.com",
            &[
                ("X-Amz-ChannelARN", "arn:aws:kinesisvideo:us-west-2:1:channel/a/1"),
                ("X-Amz-ClientId", "viewer-1"),
            ],
            &params,
        )
        .expect("presigned");

        assert_eq!(url.path(), "/");
        let keys: Vec<String> = url.query_pairs().map(|(key, _)| key.into_owned()).collect();
        assert_eq!(
            keys,
            vec![
                "X-Amz-Algorithm",
                "X-Amz-ChannelARN",
                "X-Amz-ClientId",
                "X-Amz-Credential",
                "X-Amz-Date",
                "X-Amz-Expires",
                "X-Amz-Security-Token",
                "X-Amz-SignedHeaders",
                "X-Amz-Signature",
            ]
        );
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[1].1, "arn:aws:kinesisvideo:us-west-2:1:channel/a/1");
        assert_eq!(pairs[3].1, "AKID/20240101/us-west-2/kinesisvideo/aws4_request");
        assert_eq!(pairs[5].1, "299");
        assert_eq!(pairs[6].1, "tok/en");
        assert_eq!(pairs[8].1.len(), 64);
        assert!(url.as_str().contains("X-Amz-ChannelARN=arn%3Aaws%3Akinesisvideo"));
    }

    #[test]
    fn presigning_is_deterministic_for_a_fixed_time() {
        let credentials = Credentials::new("AKID", "secret");
        let params = SigningParams {
            credentials: &credentials,
            region: "us-west-2",
            service: SERVICE,
            time: at("20240101T000000Z"),
        };
        let first = presign_url("wss://m.example.com", &[("X-Amz-ChannelARN", "arn")], &params)
            .expect("presigned");
        let second = presign_url("wss://m.example.com", &[("X-Amz-ChannelARN", "arn")], &params)
            .expect("presigned");
        assert_eq!(first, second);
        assert!(!first.as_str().contains("X-Amz-Security-Token"));
    }
}
