//! Secrets and the certificates held in TLS secrets.

use k8s_openapi::api::core::v1::Secret;
use quarry_core::{QuarryError, Value};
use quarry_store::{FieldClass, JsonCodec, ResourceSchema};

use crate::{object_schema, K8sKind};

const TLS_TYPE: &str = "kubernetes.io/tls";
const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const END: &str = "-----END CERTIFICATE-----";

pub(crate) fn secret_schema() -> ResourceSchema {
    object_schema(K8sKind::Secret)
        .codec(JsonCodec::<Secret>::new())
        .arg_field("type")
        .field("certificates", FieldClass::Static, |_, res| async move {
            let secret = res.require_internal::<Secret>()?;
            if secret.type_.as_deref() != Some(TLS_TYPE) {
                // not an error: the secret just holds no certificate
                return Ok(Value::Null);
            }
            let raw = secret
                .data
                .as_ref()
                .and_then(|d| d.get("tls.crt"))
                .ok_or_else(|| QuarryError::not_found("could not find the 'tls.crt' key"))?;
            let text = std::str::from_utf8(&raw.0).map_err(|e| QuarryError::io(format!("tls.crt is not PEM: {e}")))?;
            Ok(Value::from(pem_blocks(text)))
        })
}

/// PEM certificate blocks in order of appearance.
pub(crate) fn pem_blocks(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(BEGIN) {
        let Some(len) = rest[start..].find(END) else { break };
        let end = start + len + END.len();
        out.push(rest[start..end].to_string());
        rest = &rest[end..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_blocks_split_chain_and_ignore_noise() {
        let chain = format!("subject=leaf\n{BEGIN}\nAAA\n{END}\n\n{BEGIN}\nBBB\n{END}\n{BEGIN}\ntruncated");
        let blocks = pem_blocks(&chain);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("AAA") && blocks[0].ends_with(END));
        assert!(blocks[1].contains("BBB"));
        assert!(pem_blocks("").is_empty());
    }
}
