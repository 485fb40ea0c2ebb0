use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use hyper_rustls::HttpsConnectorBuilder;

// Creates the connector used by the datafile requester, the event dispatcher and the CMAB client.
//
// Certificates are verified against the system's native certificate store. Plain `http` URLs are
// still accepted so that local fixtures and proxies work.
pub fn create_https_connector() -> HttpsConnector<HttpConnector> {
    HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build()
}
