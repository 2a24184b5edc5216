use agentcore_auth::hs256::{JwtHs256Token, JwtHs256Validator};
use agentcore_auth::{Claims, CapabilityToken, TokenValidator};

#[tokio::test]
async fn test_token_expiry_validation() {
    let secret = "test_secret";
    let now = chrono::Utc::now().timestamp() as u64;

    let exp = (now as i64 - 1).max(0) as u64;
    let claims = Claims {
        sub: "tester".into(),
        scopes: vec![],
        iat: now,
        exp,
        jti: "test".into(),
    };

    let token = JwtHs256Token::mint(&claims, secret.as_bytes()).await.unwrap();
    let validator = JwtHs256Validator::new(secret);

    let result = validator.validate(token.as_str(), &[]).await;
    assert!(result.is_err());

    let exp2 = (now as i64 - 10).max(0) as u64;
    let claims2 = Claims {
        sub: "tester".into(),
        scopes: vec![],
        iat: now,
        exp: exp2,
        jti: "test2".into(),
    };

    let token2 = JwtHs256Token::mint(&claims2, secret.as_bytes()).await.unwrap();
    let result2 = validator.validate(token2.as_str(), &[]).await;
    assert!(result2.is_err());
}

#[tokio::test]
async fn test_valid_token_validation() {
    let secret = "test_secret";
    let now = chrono::Utc::now().timestamp() as u64;

    let exp = now + 3600;
    let claims = Claims {
        sub: "tester".into(),
        scopes: vec!["agent:read".into(), "agent:write".into()],
        iat: now,
        exp,
        jti: "test".into(),
    };

    let token = JwtHs256Token::mint(&claims, secret.as_bytes()).await.unwrap();
    let validator = JwtHs256Validator::new(secret);

    let result = validator.validate(token.as_str(), &["agent:read"]).await;
    assert!(result.is_ok());

    let validated_claims = result.unwrap();
    assert_eq!(validated_claims.sub, "tester");
    assert_eq!(validated_claims.scopes, vec!["agent:read", "agent:write"]);
}
