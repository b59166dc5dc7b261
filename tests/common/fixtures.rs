//! Mock responses and item builders

use relay_dl::{Artifact, Item};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Public URL the mock sink hands back for `filename`
pub fn published_url(filename: &str) -> String {
    format!("https://cdn.sink.test/f/{filename}")
}

/// Item with a single artifact
pub fn item_with_artifact(id: &str, title: &str, fetch_url: &str) -> Item {
    Item::new(id, title, format!("https://listing.test/{id}")).with_artifact(Artifact::new(fetch_url))
}

/// Item without artifacts
pub fn bare_item(id: &str, title: &str) -> Item {
    Item::new(id, title, format!("https://listing.test/{id}"))
}

/// Serve `body` at `/files/<name>` on the origin, expecting `times` requests
pub async fn serve_artifact(origin: &MockServer, name: &str, body: &[u8], times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/files/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .expect(times)
        .mount(origin)
        .await;
}

/// Answer `PUT /upload/<filename>` with a public URL, expecting `times` requests
pub async fn accept_upload(sink: &MockServer, filename: &str, times: u64) {
    Mock::given(method("PUT"))
        .and(path(format!("/upload/{filename}")))
        .respond_with(ResponseTemplate::new(201).set_body_string(published_url(filename)))
        .expect(times)
        .mount(sink)
        .await;
}

/// Answer `PUT /upload/<filename>` with `status`, expecting `times` requests
pub async fn fail_upload(sink: &MockServer, filename: &str, status: u16, times: u64) {
    Mock::given(method("PUT"))
        .and(path(format!("/upload/{filename}")))
        .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
        .expect(times)
        .mount(sink)
        .await;
}

/// Answer the first `failures` uploads of `filename` with 503, then accept
pub async fn flaky_upload(sink: &MockServer, filename: &str, failures: u64) {
    Mock::given(method("PUT"))
        .and(path(format!("/upload/{filename}")))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(failures)
        .with_priority(1)
        .expect(failures)
        .mount(sink)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/upload/{filename}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(published_url(filename)))
        .with_priority(2)
        .expect(1)
        .mount(sink)
        .await;
}
