use peerchat::Direction;
use peerchat_cli::demo;

#[tokio::test]
async fn test_demo_exchanges_messages() {
    let (first, second) = demo::run(demo::fast_config()).await.unwrap();

    let first: Vec<_> = first.iter().map(|m| (m.content.as_str(), m.direction)).collect();
    let second: Vec<_> = second.iter().map(|m| (m.content.as_str(), m.direction)).collect();
    assert_eq!(first, vec![("hello", Direction::Local), ("hi", Direction::Remote)]);
    assert_eq!(second, vec![("hello", Direction::Remote), ("hi", Direction::Local)]);
}
