// Every Wordnik fixture shipped with the workspace must either parse or be an
// intentionally malformed payload.

use std::path::Path;

use wotd_adapters::{load_fixture_payload, parse_wordnik_payload};
use wotd_core::PipelineError;

#[test]
fn shipped_fixtures_parse_as_expected() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/wordnik");
    assert!(root.join("word_of_the_day.json").exists());
    assert!(root.join("no_definitions.json").exists());

    let artifact = load_fixture_payload(root.join("word_of_the_day.json")).expect("valid fixture");
    assert_eq!(artifact.word(), "lagniappe");

    let raw = std::fs::read(root.join("no_definitions.json")).expect("read");
    assert!(matches!(
        parse_wordnik_payload(&raw),
        Err(PipelineError::MalformedResponse(_))
    ));
}
