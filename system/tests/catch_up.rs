use easel_system::{
    Disposition, DrawOperation, Message, Notification, RasterTransfer, SessionInfo, SessionMode,
    SessionState, StrokeInfo, ToolInfo, ToolKind, ToolMode,
};

fn session_info() -> SessionInfo {
    SessionInfo {
        id: 5,
        alias: Some("sketch".into()),
        owner: 1,
        width: 800,
        height: 600,
        user_limit: 10,
        mode: SessionMode::default(),
    }
}

fn operations() -> Vec<DrawOperation> {
    vec![
        DrawOperation::ToolInfo(ToolInfo {
            user: 1,
            tool: ToolKind::Brush,
            mode: ToolMode::Normal,
            lo_color: [0, 0, 0, 255],
            hi_color: [255, 0, 0, 255],
            lo_size: 1,
            hi_size: 8,
            lo_hardness: 0,
            hi_hardness: 255,
        }),
        DrawOperation::StrokeInfo(StrokeInfo {
            user: 1,
            x: 10,
            y: 10,
            pressure: 100,
        }),
        DrawOperation::StrokeInfo(StrokeInfo {
            user: 2,
            x: -5,
            y: 7,
            pressure: 255,
        }),
        DrawOperation::StrokeEnd { user: 1 },
        DrawOperation::StrokeEnd { user: 2 },
    ]
}

fn applied(notifications: Vec<Notification>) -> Vec<DrawOperation> {
    notifications
        .into_iter()
        .filter_map(|n| match n {
            Notification::ToolReceived(tool) => Some(DrawOperation::ToolInfo(tool)),
            Notification::StrokeReceived(point) => Some(DrawOperation::StrokeInfo(point)),
            Notification::StrokeEndReceived(user) => Some(DrawOperation::StrokeEnd { user }),
            _ => None,
        })
        .collect()
}

#[test]
fn late_joiner_applies_interleaved_operations_in_order_after_the_last_chunk() {
    let snapshot: Vec<u8> = (0..13u8).collect();
    let mut transfer = RasterTransfer::with_chunk_size(snapshot.clone(), 4).expect("");
    let mut client = SessionState::new(3, "carol", session_info());

    let mut ops = operations().into_iter();
    let mut seen = Vec::new();
    while let Some(chunk) = transfer.next_chunk() {
        let last = chunk.is_last();
        client.handle_message(Message::Raster(chunk)).expect("");
        seen.extend(applied(client.consume_notifications()));
        if !last {
            assert!(seen.is_empty());
            if let Some(op) = ops.next() {
                assert_eq!(
                    client.handle_message(op.into_message()).expect(""),
                    Disposition::Buffered
                );
            }
        }
    }

    for op in ops {
        assert_eq!(
            client.handle_message(op.into_message()).expect(""),
            Disposition::Consumed
        );
    }
    seen.extend(applied(client.consume_notifications()));

    assert_eq!(seen, operations());
    assert_eq!(client.session_image(), Some(snapshot.as_slice()));
}

#[test]
fn empty_canvas_sentinel_releases_the_buffer() {
    let mut transfer = RasterTransfer::new(Vec::new()).expect("");
    let mut client = SessionState::new(3, "carol", session_info());

    for op in operations() {
        client.handle_message(op.into_message()).expect("");
    }
    assert_eq!(client.buffered_operations(), operations().len());

    let chunk = transfer.next_chunk().expect("");
    client.handle_message(Message::Raster(chunk)).expect("");

    assert_eq!(applied(client.consume_notifications()), operations());
    assert_eq!(client.session_image(), Some(&b""[..]));
}
