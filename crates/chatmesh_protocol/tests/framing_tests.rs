use chatmesh_domain::{InstanceId, Message, MessageKind, RoomId, UserId};
use chatmesh_protocol::{
	BusEnvelope, DEFAULT_MAX_FRAME_SIZE, FramingError, ProtocolError, WireKind, WireMessage, decode_bus_frame,
	encode_bus_frame, encode_frame,
};
use proptest::prelude::*;

fn instance(id: &str) -> InstanceId {
	InstanceId::new(id).expect("valid InstanceId")
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn wire_msg(kind: i32) -> WireMessage {
	WireMessage {
		id: "m-1".to_string(),
		sender_id: "alice".to_string(),
		receiver_id: Some("bob".to_string()),
		room_id: None,
		kind,
		payload: "hi".to_string(),
		timestamp_unix_ms: 1_700_000_000_000,
	}
}

#[test]
fn bus_frame_preserves_origin_and_message() {
	let origin = instance("srv1");
	let msg = Message::direct(user("alice"), user("bob"), "hello");

	let frame = encode_bus_frame(&origin, &msg).expect("encode");
	let decoded = decode_bus_frame(&frame).expect("decode");

	assert_eq!(decoded.origin, origin);
	assert_eq!(decoded.message, msg);
}

#[test]
fn room_and_broadcast_messages_keep_their_shape() {
	let origin = instance("srv1");

	let room = Message::room(user("alice"), RoomId::new("lobby").unwrap(), "hey all");
	let decoded = decode_bus_frame(&encode_bus_frame(&origin, &room).unwrap()).unwrap();
	assert_eq!(decoded.message.room_id.as_ref().map(|r| r.as_str()), Some("lobby"));
	assert!(decoded.message.receiver_id.is_none());

	let join = Message::join(user("carol"));
	let decoded = decode_bus_frame(&encode_bus_frame(&origin, &join).unwrap()).unwrap();
	assert_eq!(decoded.message.kind, MessageKind::Join);
}

#[test]
fn rejects_other_major_version() {
	let mut env = BusEnvelope::new(&instance("srv1"), &Message::join(user("dave")));
	env.version = 2;
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();

	match decode_bus_frame(&frame) {
		Err(ProtocolError::UnsupportedVersion(2)) => {}
		other => panic!("expected UnsupportedVersion, got {other:?}"),
	}
}

#[test]
fn rejects_envelope_without_message() {
	let env = BusEnvelope {
		version: 1,
		origin_instance: "srv1".to_string(),
		message: None,
	};
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();
	assert!(matches!(decode_bus_frame(&frame), Err(ProtocolError::MissingMessage)));
}

#[test]
fn rejects_unknown_kind_and_empty_sender() {
	let env = BusEnvelope {
		version: 1,
		origin_instance: "srv1".to_string(),
		message: Some(wire_msg(WireKind::Unspecified as i32)),
	};
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();
	assert!(matches!(decode_bus_frame(&frame), Err(ProtocolError::UnknownKind(0))));

	let mut wire = wire_msg(WireKind::Chat as i32);
	wire.sender_id = "  ".to_string();
	let env = BusEnvelope {
		version: 1,
		origin_instance: "srv1".to_string(),
		message: Some(wire),
	};
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();
	assert!(matches!(decode_bus_frame(&frame), Err(ProtocolError::InvalidMessage(_))));
}

#[test]
fn blank_receiver_is_treated_as_absent() {
	let mut wire = wire_msg(WireKind::Chat as i32);
	wire.receiver_id = Some(String::new());
	wire.room_id = Some("lobby".to_string());
	let env = BusEnvelope {
		version: 1,
		origin_instance: "srv1".to_string(),
		message: Some(wire),
	};

	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();
	let decoded = decode_bus_frame(&frame).expect("decode");
	assert!(decoded.message.receiver_id.is_none());
	assert_eq!(decoded.message.room_id.map(|r| r.into_string()), Some("lobby".to_string()));
}

#[test]
fn encode_rejects_too_large_payload() {
	let env = BusEnvelope::new(
		&instance("srv1"),
		&Message::direct(user("alice"), user("bob"), "a".repeat(DEFAULT_MAX_FRAME_SIZE + 1)),
	);

	match encode_frame(&env, DEFAULT_MAX_FRAME_SIZE) {
		Err(FramingError::FrameTooLarge { len, max }) => assert!(len > max),
		other => panic!("expected FrameTooLarge, got {other:?}"),
	}
}

#[test]
fn decode_rejects_oversized_prefix() {
	let mut buf = (DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes().to_vec();
	buf.extend_from_slice(&[0u8; 8]);

	match decode_bus_frame(&buf) {
		Err(ProtocolError::Framing(FramingError::FrameTooLarge { .. })) => {}
		other => panic!("expected FrameTooLarge, got {other:?}"),
	}
}

proptest! {
	#[test]
	fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
		let _ = decode_bus_frame(&bytes);
	}

	#[test]
	fn truncated_frames_are_rejected(payload in "[a-z]{1,64}", cut in 1usize..16) {
		let msg = Message::direct(user("alice"), user("bob"), payload);
		let frame = encode_bus_frame(&instance("srv1"), &msg).unwrap();
		let cut = cut.min(frame.len() - 1);
		prop_assert!(decode_bus_frame(&frame[..frame.len() - cut]).is_err());
	}
}
