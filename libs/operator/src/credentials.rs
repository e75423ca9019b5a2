use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::error::{Error, Result};

const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// AWS credentials read out of a namespaced opaque secret, ready to be overlaid onto a child
/// process's environment. Does not implement `Debug`/`Display` so a stray log line can't leak
/// the secret values.
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Loads `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`/optional `AWS_SESSION_TOKEN` out of
    /// the named secret's base64-encoded `data` map.
    pub async fn load(client: Client, namespace: &str, secret_name: &str) -> Result<Self> {
        let api: Api<Secret> = Api::namespaced(client, namespace);
        let secret = api.get(secret_name).await.map_err(|e| match &e {
            kube::Error::Api(ae) if ae.code == 404 => Error::CredentialsSecretMissing(
                namespace.to_owned(),
                secret_name.to_owned(),
            ),
            _ => Error::KubeError(e),
        })?;

        let data = secret.data.unwrap_or_default();

        let access_key_id = Self::decode(&data, namespace, secret_name, ACCESS_KEY_ID)?;
        let secret_access_key = Self::decode(&data, namespace, secret_name, SECRET_ACCESS_KEY)?;
        let session_token = match data.get(SESSION_TOKEN) {
            Some(v) => Some(Self::decode_bytes(v.0.clone())?),
            None => None,
        };

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }

    fn decode(
        data: &std::collections::BTreeMap<String, k8s_openapi::ByteString>,
        namespace: &str,
        secret_name: &str,
        key: &'static str,
    ) -> Result<String> {
        let value = data.get(key).ok_or_else(|| {
            Error::CredentialsSecretMalformed(namespace.to_owned(), secret_name.to_owned(), key)
        })?;
        Self::decode_bytes(value.0.clone())
    }

    fn decode_bytes(raw: Vec<u8>) -> Result<String> {
        // k8s-openapi already base64-decodes Secret.data into raw bytes for us; guard against
        // the rare case of a double-encoded value some users paste in by hand.
        match String::from_utf8(raw.clone()) {
            Ok(s) if s.is_ascii() && !s.is_empty() => Ok(s),
            _ => {
                let decoded = BASE64.decode(raw)?;
                Ok(String::from_utf8(decoded)?)
            }
        }
    }

    /// The environment overlay passed to every subprocess needing AWS access, including the
    /// CDK-expected account/region mirrors.
    pub fn env(&self, region: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(ACCESS_KEY_ID.to_owned(), self.access_key_id.clone());
        env.insert(SECRET_ACCESS_KEY.to_owned(), self.secret_access_key.clone());
        if let Some(token) = &self.session_token {
            env.insert(SESSION_TOKEN.to_owned(), token.clone());
        }
        env.insert("AWS_DEFAULT_REGION".to_owned(), region.to_owned());
        env.insert("AWS_REGION".to_owned(), region.to_owned());
        env
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_bytes_accepts_plain_ascii() {
        let decoded = AwsCredentials::decode_bytes(b"AKIAEXAMPLE".to_vec()).unwrap();
        assert_eq!(decoded, "AKIAEXAMPLE");
    }

    #[test]
    fn env_includes_region_mirrors() {
        let creds = AwsCredentials {
            access_key_id: "AKIA".to_owned(),
            secret_access_key: "secret".to_owned(),
            session_token: None,
        };
        let env = creds.env("eu-west-1");
        assert_eq!(env.get("AWS_REGION").unwrap(), "eu-west-1");
        assert_eq!(env.get("AWS_DEFAULT_REGION").unwrap(), "eu-west-1");
        assert!(!env.contains_key(SESSION_TOKEN));
    }

    #[test]
    fn env_includes_session_token_when_present() {
        let creds = AwsCredentials {
            access_key_id: "AKIA".to_owned(),
            secret_access_key: "secret".to_owned(),
            session_token: Some("token".to_owned()),
        };
        let env = creds.env("us-east-1");
        assert_eq!(env.get(SESSION_TOKEN).unwrap(), "token");
    }
}
