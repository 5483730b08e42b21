use boring::pkey::PKey;
use boring::ssl::{select_next_proto, AlpnError, SslAcceptor, SslMethod};
use boring::x509::X509;

/// A self-signed acceptor for 127.0.0.1 that selects `alpn` (wire format,
/// e.g. `b"\x02h2"`), plus the certificate in PEM to trust on the client.
pub fn acceptor(alpn: &'static [u8]) -> (SslAcceptor, Vec<u8>) {
    let names = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    let cert = rcgen::generate_simple_self_signed(names).expect("generate cert");
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    let pkey = PKey::private_key_from_pem(key_pem.as_bytes()).expect("parse key");
    let x509 = X509::from_pem(cert_pem.as_bytes()).expect("parse cert");

    let mut builder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).expect("acceptor builder");
    builder.set_private_key(&pkey).expect("set key");
    builder.set_certificate(&x509).expect("set cert");
    builder.set_alpn_select_callback(move |_, offered| {
        select_next_proto(alpn, offered).ok_or(AlpnError::NOACK)
    });

    (builder.build(), cert_pem.into_bytes())
}
