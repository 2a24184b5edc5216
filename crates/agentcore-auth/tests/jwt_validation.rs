use agentcore_auth::hs256::{build_claims, JwtHs256Token, JwtHs256Validator};
use agentcore_auth::{CapabilityToken, TokenValidator};

#[tokio::test]
async fn test_jwt_hs256_mint_and_validate() {
    let secret = "super_secret_key";
    let claims = build_claims("agent-1", vec!["agent:read".into(), "agent:write".into()], 3600).unwrap();

    let token = JwtHs256Token::mint(&claims, secret.as_bytes()).await.unwrap();
    let validator = JwtHs256Validator::new(secret);

    let validated = validator
        .validate(token.as_str(), &["agent:read"])
        .await
        .unwrap();
    assert_eq!(validated.sub, claims.sub);
    assert_eq!(validated.scopes, claims.scopes);
}

#[tokio::test]
async fn test_jwt_hs256_invalid_token_is_rejected() {
    let validator = JwtHs256Validator::new("some_secret");
    assert!(validator.validate("not.a.valid.jwt", &[]).await.is_err());
}

#[tokio::test]
async fn test_jwt_hs256_rejects_missing_scope() {
    let secret = "super_secret_key";
    let claims = build_claims("agent-1", vec!["agent:read".into()], 3600).unwrap();
    let token = JwtHs256Token::mint(&claims, secret.as_bytes()).await.unwrap();
    let validator = JwtHs256Validator::new(secret);

    let err = validator
        .validate(token.as_str(), &["admin"])
        .await
        .unwrap_err();
    assert_eq!(err.code, "AUTH.AUTHORIZATION.INSUFFICIENT_SCOPE");
}
