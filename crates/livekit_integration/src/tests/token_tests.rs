use super::*;
use jsonwebtoken::{decode, DecodingKey, Validation};

fn config() -> LiveKitConfig {
    LiveKitConfig {
        api_key: "devkey".into(),
        api_secret: "devsecret".into(),
        ttl_seconds: 60,
        url: "ws://127.0.0.1:7880".into(),
    }
}

fn decode_claims(cfg: &LiveKitConfig, token: &str) -> serde_json::Value {
    decode::<serde_json::Value>(
        token,
        &DecodingKey::from_secret(cfg.api_secret.as_bytes()),
        &Validation::default(),
    )
    .expect("decode")
    .claims
}

#[test]
fn deterministic_room_name() {
    let room = room_name_for_voice_channel(ServerId(10), ChannelId(42));
    assert_eq!(room, "10:42");
}

#[test]
fn participant_token_grants_join_publish_and_subscribe() {
    let cfg = config();
    let token = mint_token(&cfg, "7", Some("Alice"), &TokenGrant::participant("1:2")).expect("token");
    let claims = decode_claims(&cfg, &token);

    assert_eq!(claims["iss"], "devkey");
    assert_eq!(claims["sub"], "7");
    assert_eq!(claims["name"], "Alice");
    assert_eq!(claims["video"]["room"], "1:2");
    assert_eq!(claims["video"]["roomJoin"], true);
    assert_eq!(claims["video"]["canPublish"], true);
    assert_eq!(claims["video"]["canSubscribe"], true);
    assert_eq!(claims["video"]["roomAdmin"], false);
    assert_eq!(
        claims["exp"].as_i64().expect("exp") - claims["iat"].as_i64().expect("iat"),
        60
    );
}

#[test]
fn admin_token_cannot_join() {
    let cfg = config();
    let token = mint_token(&cfg, "room-service", None, &TokenGrant::room_admin("1:2")).expect("token");
    let claims = decode_claims(&cfg, &token);

    assert_eq!(claims["video"]["roomAdmin"], true);
    assert_eq!(claims["video"]["roomJoin"], false);
    assert!(claims.get("name").is_none());
}
