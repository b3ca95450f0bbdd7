use super::*;
use crate::{
    BigVector, MapCalcSettings, MapSectionRequest, RPoint, RSize, RValue, SizeInt, SubdivisionId,
};

fn request(target: u32) -> MapSectionRequest {
    // 8x8 block covering [-2, 0) x [-1, 1) in steps of 1/4.
    MapSectionRequest::new(
        1,
        0,
        SubdivisionId::from("s"),
        BigVector::zero(),
        RPoint::new(RValue::new(-2, 0), RValue::new(-1, 0)),
        RSize::square(RValue::new(1, -2)),
        MapCalcSettings::new(target),
    )
    .with_block_size(SizeInt::new(8, 8))
}

#[test]
fn recognises_local_addresses() {
    assert!(is_local_address("local"));
    assert!(is_local_address("localhost"));
    assert!(is_local_address("LOCALHOST:5000"));
    assert!(is_local_address("http://localhost:5000/api"));
    assert!(is_local_address("127.0.0.1"));
    assert!(is_local_address("127.0.0.1:5001"));
    assert!(is_local_address("::1"));
    assert!(is_local_address("[::1]:5000"));

    assert!(!is_local_address("10.0.0.5:5000"));
    assert!(!is_local_address("compute.example.net"));
    assert!(!is_local_address("https://compute.example.net:443"));
}

#[test]
fn engine_locality_follows_its_address() {
    assert!(LocalEngine::new().is_local());
    assert!(!LocalEngine::with_address("gpu-box:5000").is_local());
}

#[tokio::test]
async fn generates_a_complete_block() {
    let engine = LocalEngine::new();
    let mut req = request(50);
    let resp = engine
        .generate(&mut req, &CancellationToken::new())
        .await
        .unwrap();

    assert!(resp.request_completed);
    assert!(!resp.request_cancelled);
    let vectors = resp.vectors.as_deref().unwrap();
    assert_eq!(vectors.len(), 64);
    // (-2, -1) escapes quickly, (-0.25, 0) is inside the main cardioid.
    assert!(vectors.is_done(0));
    assert!(vectors.counts[0] < 5);
    let inside = 4 * 8 + 7;
    assert!(!vectors.is_done(inside));
    assert_eq!(vectors.counts[inside], 50);
}

#[tokio::test]
async fn refinement_keeps_done_pixels() {
    let engine = LocalEngine::new();
    let mut first = request(20);
    let low = engine
        .generate(&mut first, &CancellationToken::new())
        .await
        .unwrap();
    let low_vectors = low.vectors.as_deref().unwrap().clone();

    let mut second = request(200);
    second.seed_from(&low_vectors, None);
    let high = engine
        .generate(&mut second, &CancellationToken::new())
        .await
        .unwrap();
    let high_vectors = high.vectors.as_deref().unwrap();

    assert!(second.vectors.is_none());
    for idx in 0..low_vectors.len() {
        if low_vectors.is_done(idx) {
            assert!(high_vectors.is_done(idx));
            assert_eq!(high_vectors.counts[idx], low_vectors.counts[idx]);
        }
    }
    assert!(high_vectors.done_count() >= low_vectors.done_count());
    assert_eq!(high.map_calc_settings.target_iterations, 200);
}

#[tokio::test]
async fn cancelled_token_yields_incomplete_result() {
    let engine = LocalEngine::new();
    let token = CancellationToken::new();
    token.cancel();
    let mut req = request(50);
    let resp = engine.generate(&mut req, &token).await.unwrap();
    assert!(!resp.request_completed);
    assert_eq!(resp.vectors.as_deref().unwrap().done_count(), 0);
}
