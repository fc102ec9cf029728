//! End-to-end call flows against the mock transport and media engine:
//! outgoing setup, hold/resume, DTMF ordering, incoming decline/accept,
//! busy rejection and teardown bookkeeping.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{register_ok, MockMedia, MockTransport, MockTransportFactory, RecordingCallLog};
use siprtc_client_core::{
    CallLogClass, CallState, ClientBuilder, ClientEvent, ClientManager,
};
use siprtc_sip_core::{
    generate_branch, Address, Contact, HeaderAccess, Method, Request, RequestBuilder,
    ResponseBuilder, StatusCode, Uri,
};
use tokio::sync::broadcast;

const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 10.0.0.2\r\ns=-\r\nt=0 0\r\n\
    m=audio 40000 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=sendrecv\r\n";

struct Harness {
    client: Arc<ClientManager>,
    media: Arc<MockMedia>,
    log: Arc<RecordingCallLog>,
    session: Arc<MockTransport>,
    events: broadcast::Receiver<ClientEvent>,
}

/// Build a client and complete registration for alice@example.com.
async fn registered_client() -> Harness {
    let factory = MockTransportFactory::new();
    let media = MockMedia::new();
    let log = RecordingCallLog::new();
    let client = ClientBuilder::new()
        .websocket_url("wss://edge.example.com/ws")
        .user_agent("TestUA/1.0")
        .transport_factory(factory.clone())
        .media_engine(media.clone())
        .call_log(log.clone())
        .build()
        .expect("client builds");
    let events = client.subscribe_events();

    let register = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .register("alice", "secret", "example.com", None, None)
                .await
        })
    };
    let session = factory.wait_for_session(1).await;
    let request = session.next_request("REGISTER").await;
    session.inject(register_ok(&request)).await;
    register.await.unwrap().expect("registration succeeds");

    Harness {
        client,
        media,
        log,
        session,
        events,
    }
}

/// Wait for the next call-state record, skipping other event kinds.
async fn next_call_state(events: &mut broadcast::Receiver<ClientEvent>) -> CallState {
    let fut = async {
        loop {
            match events.recv().await.expect("event stream alive") {
                ClientEvent::CallStateChanged(record) => return record.state,
                _ => continue,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for a call state record")
}

fn incoming_invite(call_id: &str, branch: &str) -> Request {
    RequestBuilder::new(Method::Invite, "sip:alice@example.com")
        .unwrap()
        .via("peer.example.com", "WS", branch)
        .from(
            Address::new(Uri::sip("bob", "example.com"))
                .with_display_name("Bob")
                .with_tag("bobtag"),
        )
        .to(Address::new(Uri::sip("alice", "example.com")))
        .call_id(call_id)
        .cseq(1)
        .contact(Contact::new(Address::new(Uri::sip("bob", "peer.example.com"))))
        .body("application/sdp", ANSWER_SDP)
        .build()
}

#[tokio::test]
async fn outgoing_call_walks_the_documented_state_sequence() {
    let mut h = registered_client().await;

    let call = {
        let client = h.client.clone();
        tokio::spawn(async move { client.make_call("+15550123").await })
    };

    let invite = h.session.next_request("INVITE").await;
    assert_eq!(invite.uri.to_string(), "sip:+15550123@example.com");
    assert_eq!(invite.content_type(), Some("application/sdp"));
    assert!(invite.body.contains("a=sendrecv"));
    let invite_cseq = invite.cseq().unwrap().seq;

    assert_eq!(next_call_state(&mut h.events).await, CallState::OutgoingInit);

    let trying = ResponseBuilder::reply(StatusCode::Trying, &invite).build();
    h.session.inject(trying.to_string()).await;
    assert_eq!(next_call_state(&mut h.events).await, CallState::OutgoingProgress);

    let ringing = ResponseBuilder::reply(StatusCode::Ringing, &invite)
        .to_tag("peertag")
        .build();
    h.session.inject(ringing.to_string()).await;
    assert_eq!(next_call_state(&mut h.events).await, CallState::OutgoingRinging);

    let ok = ResponseBuilder::reply(StatusCode::Ok, &invite)
        .to_tag("peertag")
        .contact(Contact::new(Address::new(Uri::sip("bob", "peer.example.com"))))
        .body("application/sdp", ANSWER_SDP)
        .build();
    h.session.inject(ok.to_string()).await;

    let ack = h.session.next_request("ACK").await;
    assert_eq!(ack.uri.host, "peer.example.com");
    assert_eq!(ack.cseq().unwrap().seq, invite_cseq, "ACK reuses the INVITE CSeq number");
    assert_eq!(next_call_state(&mut h.events).await, CallState::Connected);

    h.media.report_connected();
    assert_eq!(next_call_state(&mut h.events).await, CallState::StreamsRunning);

    call.await.unwrap().expect("call placed");
}

#[tokio::test]
async fn hold_resume_and_dtmf_preserve_cseq_order() {
    let h = registered_client().await;

    // Establish the call.
    let call = {
        let client = h.client.clone();
        tokio::spawn(async move { client.make_call("bob").await })
    };
    let invite = h.session.next_request("INVITE").await;
    let invite_cseq = invite.cseq().unwrap().seq;
    let ok = ResponseBuilder::reply(StatusCode::Ok, &invite)
        .to_tag("peertag")
        .contact(Contact::new(Address::new(Uri::sip("bob", "peer.example.com"))))
        .body("application/sdp", ANSWER_SDP)
        .build();
    h.session.inject(ok.to_string()).await;
    let _ack = h.session.next_request("ACK").await;
    call.await.unwrap().unwrap();
    h.media.report_connected();

    // Hold: re-INVITE with a paused direction.
    let hold = {
        let client = h.client.clone();
        tokio::spawn(async move { client.hold(None).await })
    };
    let hold_reinvite = h.session.next_request("INVITE").await;
    assert!(hold_reinvite.body.contains("a=sendonly"));
    let hold_cseq = hold_reinvite.cseq().unwrap().seq;
    assert!(hold_cseq > invite_cseq);

    let hold_ok = ResponseBuilder::reply(StatusCode::Ok, &hold_reinvite)
        .contact(Contact::new(Address::new(Uri::sip("bob", "peer.example.com"))))
        .body("application/sdp", ANSWER_SDP.replace("a=sendrecv", "a=recvonly"))
        .build();
    h.session.inject(hold_ok.to_string()).await;
    let hold_ack = h.session.next_request("ACK").await;
    assert_eq!(hold_ack.cseq().unwrap().seq, hold_cseq);
    hold.await.unwrap().expect("hold succeeds");
    assert_eq!(
        h.client.call_info(None).await.unwrap().unwrap().state,
        CallState::Paused
    );

    // Resume restores sendrecv with a strictly higher CSeq.
    let resume = {
        let client = h.client.clone();
        tokio::spawn(async move { client.resume(None).await })
    };
    let resume_reinvite = h.session.next_request("INVITE").await;
    assert!(resume_reinvite.body.contains("a=sendrecv"));
    let resume_cseq = resume_reinvite.cseq().unwrap().seq;
    assert!(resume_cseq > hold_cseq);
    let resume_ok = ResponseBuilder::reply(StatusCode::Ok, &resume_reinvite)
        .contact(Contact::new(Address::new(Uri::sip("bob", "peer.example.com"))))
        .body("application/sdp", ANSWER_SDP)
        .build();
    h.session.inject(resume_ok.to_string()).await;
    let _resume_ack = h.session.next_request("ACK").await;
    resume.await.unwrap().expect("resume succeeds");
    assert_eq!(
        h.client.call_info(None).await.unwrap().unwrap().state,
        CallState::StreamsRunning
    );

    // DTMF over INFO (media engine refuses) keeps the in-dialog order.
    h.media.refuse_dtmf();
    let dtmf = {
        let client = h.client.clone();
        tokio::spawn(async move { client.send_dtmf_sequence("12").await })
    };
    let info_one = h.session.next_request("INFO").await;
    assert!(info_one.body.contains("Signal=1"));
    assert_eq!(info_one.content_type(), Some("application/dtmf-relay"));
    let reply_one = ResponseBuilder::reply(StatusCode::Ok, &info_one).build();
    h.session.inject(reply_one.to_string()).await;

    let info_two = h.session.next_request("INFO").await;
    assert!(info_two.body.contains("Signal=2"));
    let reply_two = ResponseBuilder::reply(StatusCode::Ok, &info_two).build();
    h.session.inject(reply_two.to_string()).await;
    dtmf.await.unwrap().expect("dtmf sequence sent");

    let info_one_cseq = info_one.cseq().unwrap().seq;
    let info_two_cseq = info_two.cseq().unwrap().seq;
    assert!(resume_cseq < info_one_cseq, "no out-of-order in-dialog request");
    assert!(info_one_cseq < info_two_cseq);

    // Teardown: BYE, then the log records a successful call.
    let end = {
        let client = h.client.clone();
        tokio::spawn(async move { client.end_call(None).await })
    };
    let bye = h.session.next_request("BYE").await;
    assert!(bye.cseq().unwrap().seq > info_two_cseq);
    let bye_ok = ResponseBuilder::reply(StatusCode::Ok, &bye).build();
    h.session.inject(bye_ok.to_string()).await;
    end.await.unwrap().expect("hangup succeeds");

    let entries = h.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].classification, CallLogClass::Success);
    assert!(h.media.disposal_count() >= 1, "media released after the call");
}

#[tokio::test]
async fn incoming_call_declined_records_declined() {
    let mut h = registered_client().await;

    h.session
        .inject(incoming_invite("peer-call-1", "z9hG4bKincoming1").to_string())
        .await;

    let ringing = h.session.next_response(180).await;
    assert!(ringing.to().unwrap().tag().is_some(), "180 establishes the early dialog");
    assert_eq!(next_call_state(&mut h.events).await, CallState::IncomingReceived);

    h.client.decline_call(None).await.expect("decline succeeds");
    let declined = h.session.next_response(603).await;
    assert_eq!(declined.cseq().unwrap().method, Method::Invite);

    assert_eq!(next_call_state(&mut h.events).await, CallState::Ending);
    assert_eq!(next_call_state(&mut h.events).await, CallState::Ended);

    let entries = h.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].classification, CallLogClass::Declined);
}

#[tokio::test]
async fn incoming_call_accepted_then_remote_bye() {
    let mut h = registered_client().await;

    h.session
        .inject(incoming_invite("peer-call-2", "z9hG4bKincoming2").to_string())
        .await;
    let _ringing = h.session.next_response(180).await;
    assert_eq!(next_call_state(&mut h.events).await, CallState::IncomingReceived);

    h.client.accept_call(None).await.expect("accept succeeds");
    let ok = h.session.next_response(200).await;
    assert_eq!(ok.content_type(), Some("application/sdp"), "200 carries the answer");
    let our_tag = ok.to().unwrap().tag().unwrap().to_string();
    assert_eq!(next_call_state(&mut h.events).await, CallState::Connected);

    // Peer ACKs, then hangs up.
    let ack = RequestBuilder::new(Method::Ack, "sip:alice@example.com")
        .unwrap()
        .via("peer.example.com", "WS", &generate_branch())
        .from(Address::new(Uri::sip("bob", "example.com")).with_tag("bobtag"))
        .to(Address::new(Uri::sip("alice", "example.com")).with_tag(our_tag.clone()))
        .call_id("peer-call-2")
        .cseq_with_method(1, Method::Ack)
        .build();
    h.session.inject(ack.to_string()).await;

    let bye = RequestBuilder::new(Method::Bye, "sip:alice@example.com")
        .unwrap()
        .via("peer.example.com", "WS", &generate_branch())
        .from(Address::new(Uri::sip("bob", "example.com")).with_tag("bobtag"))
        .to(Address::new(Uri::sip("alice", "example.com")).with_tag(our_tag))
        .call_id("peer-call-2")
        .cseq(2)
        .build();
    h.session.inject(bye.to_string()).await;

    let _bye_ok = h.session.next_response(200).await;
    assert_eq!(next_call_state(&mut h.events).await, CallState::Ending);
    assert_eq!(next_call_state(&mut h.events).await, CallState::Ended);

    let entries = h.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].classification, CallLogClass::Success);
}

#[tokio::test]
async fn second_incoming_invite_is_answered_busy() {
    let mut h = registered_client().await;

    h.session
        .inject(incoming_invite("first-call", "z9hG4bKfirst").to_string())
        .await;
    let _ringing = h.session.next_response(180).await;
    assert_eq!(next_call_state(&mut h.events).await, CallState::IncomingReceived);

    h.session
        .inject(incoming_invite("second-call", "z9hG4bKsecond").to_string())
        .await;
    let busy = h.session.next_response(486).await;
    assert_eq!(busy.call_id().unwrap(), "second-call");

    // The first call is untouched.
    let info = h.client.call_info(None).await.unwrap().unwrap();
    assert_eq!(info.state, CallState::IncomingReceived);
    assert_eq!(info.sip_call_id, "first-call");
}

#[tokio::test]
async fn deflection_redirects_and_logs_deflected() {
    let mut h = registered_client().await;

    h.session
        .inject(incoming_invite("deflect-call", "z9hG4bKdeflect").to_string())
        .await;
    let _ringing = h.session.next_response(180).await;
    assert_eq!(next_call_state(&mut h.events).await, CallState::IncomingReceived);

    h.client
        .deflect("carol@example.com", None)
        .await
        .expect("deflection succeeds");
    let moved = h.session.next_response(302).await;
    let contact = moved.contact().unwrap();
    assert_eq!(contact.address.uri.to_string(), "sip:carol@example.com");

    assert_eq!(next_call_state(&mut h.events).await, CallState::Ending);
    assert_eq!(next_call_state(&mut h.events).await, CallState::Ended);
    let entries = h.log.entries();
    assert_eq!(entries[0].classification, CallLogClass::Deflected);
}
