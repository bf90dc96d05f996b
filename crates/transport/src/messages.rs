//! Outbound signaling message construction
//!
//! The HPB speaks polymorphic JSON; inbound frames are dispatched dynamically
//! by the orchestrator, outbound frames are built here. Builders return
//! `serde_json::Value` without an `id`; the signaling client stamps ids at
//! send time so they stay monotonic per connection.

use serde_json::{json, Value};

use lt_core::{call_flag, Transcript};

/// Display name the bridge joins calls with.
const BOT_NICK: &str = "Live Transcription";

/// Authenticated hello for internal clients.
pub fn hello_auth(nonce: &str, token: &str, backend_url: &str) -> Value {
    json!({
        "type": "hello",
        "hello": {
            "version": "2.0",
            "auth": {
                "type": "internal",
                "params": {
                    "random": nonce,
                    "token": token,
                    "backend": backend_url,
                },
            },
        },
    })
}

/// Short-resume hello for an existing session.
pub fn hello_resume(resume_id: &str) -> Value {
    json!({
        "type": "hello",
        "hello": {
            "version": "2.0",
            "resumeid": resume_id,
        },
    })
}

/// Mark the bridge as in-call (audio-less silent participant).
pub fn incall() -> Value {
    json!({
        "type": "internal",
        "internal": {
            "type": "incall",
            "incall": {
                "incall": call_flag::IN_CALL,
            },
        },
    })
}

/// Join a room with the session id from the hello response.
pub fn join_room(room_token: &str, session_id: &str) -> Value {
    json!({
        "type": "room",
        "room": {
            "roomid": room_token,
            "sessionid": session_id,
        },
    })
}

/// Ask a publisher to send us a WebRTC offer.
pub fn request_offer(publisher_session_id: &str) -> Value {
    json!({
        "type": "message",
        "message": {
            "recipient": {
                "type": "session",
                "sessionid": publisher_session_id,
            },
            "data": {
                "type": "requestoffer",
                "roomType": "video",
            },
        },
    })
}

/// SDP answer for a publisher's offer.
pub fn answer(publisher_session_id: &str, offer_sid: &str, sdp: &str) -> Value {
    json!({
        "type": "message",
        "message": {
            "recipient": {
                "type": "session",
                "sessionid": publisher_session_id,
            },
            "data": {
                "to": publisher_session_id,
                "type": "answer",
                "roomType": "video",
                "sid": offer_sid,
                "payload": {
                    "nick": BOT_NICK,
                    "type": "answer",
                    "sdp": sdp,
                },
            },
        },
    })
}

/// One local ICE candidate for a publisher.
pub fn candidate(publisher_session_id: &str, offer_sid: &str, candidate: &str) -> Value {
    json!({
        "type": "message",
        "message": {
            "recipient": {
                "type": "session",
                "sessionid": publisher_session_id,
            },
            "data": {
                "to": publisher_session_id,
                "type": "candidate",
                "sid": offer_sid,
                "roomType": "video",
                "payload": {
                    "candidate": {
                        "candidate": candidate,
                        "sdpMLineIndex": 0,
                        "sdpMid": "0",
                    },
                },
            },
        },
    })
}

/// Leave the call.
pub fn bye() -> Value {
    json!({"type": "bye", "bye": {}})
}

/// One transcript addressed to one recipient session.
pub fn transcript(recipient_session_id: &str, transcript: &Transcript) -> Value {
    json!({
        "type": "message",
        "message": {
            "recipient": {
                "type": "session",
                "sessionid": recipient_session_id,
            },
            "data": {
                "final": transcript.is_final,
                "langId": transcript.lang_id,
                "message": transcript.message,
                "speakerSessionId": transcript.speaker_session_id,
                "type": "transcript",
            },
        },
    })
}
