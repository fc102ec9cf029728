//! Property tests for the codec: parsing must never panic, and messages
//! the builders emit must round-trip through the parser unchanged.

use proptest::prelude::*;

use siprtc_sip_core::{
    parse_message, Address, Contact, Message, Method, RequestBuilder, Uri,
};

fn method_strategy() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::Register),
        Just(Method::Invite),
        Just(Method::Bye),
        Just(Method::Cancel),
        Just(Method::Options),
        Just(Method::Refer),
        Just(Method::Notify),
        Just(Method::Info),
    ]
}

prop_compose! {
    fn built_request()(
        method in method_strategy(),
        user in "[a-z][a-z0-9]{0,7}",
        host in "[a-z][a-z0-9]{0,7}\\.(com|net|org)",
        from_tag in "[0-9a-f]{8}",
        call_id in "[A-Za-z0-9]{8,20}",
        seq in 1u32..100_000,
        branch_suffix in "[0-9a-f]{16}",
        with_contact in any::<bool>(),
        body in prop_oneof![Just(String::new()), Just("v=0\r\ns=-\r\n".to_string())],
    ) -> siprtc_sip_core::Request {
        let mut builder = RequestBuilder::from_uri(method, Uri::sip(user.clone(), host.clone()))
            .via("client.invalid", "WS", &format!("z9hG4bK{branch_suffix}"))
            .from(Address::new(Uri::sip("alice", host.clone())).with_tag(from_tag))
            .to(Address::new(Uri::sip(user, host)))
            .call_id(call_id)
            .cseq(seq);
        if with_contact {
            builder = builder.contact(Contact::new(Address::new(
                Uri::sip("alice", "client.invalid").with_param("transport", "ws"),
            )));
        }
        if !body.is_empty() {
            builder = builder.body("application/sdp", body);
        }
        builder.build()
    }
}

proptest! {
    #[test]
    fn emitted_requests_round_trip(req in built_request()) {
        let wire = req.to_string();
        let parsed = parse_message(&wire).expect("emitted message parses");
        prop_assert_eq!(parsed, Message::Request(req));
    }

    #[test]
    fn parser_never_panics_on_arbitrary_input(input in ".{0,400}") {
        let _ = parse_message(&input);
    }

    #[test]
    fn parser_never_panics_on_almost_sip(
        header_junk in "[ -~]{0,60}",
        body in "[ -~]{0,40}",
    ) {
        let wire = format!(
            "INVITE sip:a@b.c SIP/2.0\r\n{header_junk}\r\n\r\n{body}"
        );
        let _ = parse_message(&wire);
    }

    #[test]
    fn header_name_case_is_canonicalized(flags in proptest::collection::vec(0u8..3, 8)) {
        let canonical = "OPTIONS sip:probe@example.com SIP/2.0\r\n\
            Via: SIP/2.0/WS client.invalid;branch=z9hG4bKcase\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:probe@example.com>\r\n\
            Call-ID: case-test\r\n\
            CSeq: 7 OPTIONS\r\n\
            Max-Forwards: 70\r\n\
            Content-Length: 0\r\n\r\n";
        let expected = parse_message(canonical).unwrap();

        // Rewrite each header name in a random casing; values untouched.
        let mut lines: Vec<String> = Vec::new();
        for (i, line) in canonical.trim_end().split("\r\n").enumerate() {
            if i == 0 || line.is_empty() {
                lines.push(line.to_string());
                continue;
            }
            let (name, rest) = line.split_once(':').unwrap();
            let mangled = match flags.get(i % flags.len()).copied().unwrap_or(0) {
                0 => name.to_ascii_lowercase(),
                1 => name.to_ascii_uppercase(),
                _ => name.to_string(),
            };
            lines.push(format!("{mangled}:{rest}"));
        }
        let wire = format!("{}\r\n\r\n", lines.join("\r\n"));
        let parsed = parse_message(&wire).unwrap();
        prop_assert_eq!(parsed, expected);
    }
}
