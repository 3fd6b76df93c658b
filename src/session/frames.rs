use crate::error::{Error, Result};
use crate::peer::data_channel::DataChannel;
use crate::stop::StopSignal;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

/// "Ready" sentinel byte on the control channel
pub const SENTINEL: u8 = 42;

/// Prefix of a launch payload frame
pub const LAUNCH_PREFIX: u8 = 0x15;

/// A message received on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Ready,
    Status(String),
    Chat(String),
    Exit(i32),
    Unrecognized(Bytes),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StructuredFrame {
    Status {
        #[serde(rename = "str")]
        text: String,
    },
    Chat {
        #[serde(rename = "str")]
        text: String,
    },
    Exit {
        code: i32,
    },
}

impl ControlFrame {
    pub fn parse(data: &Bytes) -> Self {
        if data.len() == 1 && data[0] == SENTINEL {
            return ControlFrame::Ready;
        }
        match serde_json::from_slice::<StructuredFrame>(data) {
            Ok(StructuredFrame::Status { text }) => ControlFrame::Status(text),
            Ok(StructuredFrame::Chat { text }) => ControlFrame::Chat(text),
            Ok(StructuredFrame::Exit { code }) => ControlFrame::Exit(code),
            Err(_) => ControlFrame::Unrecognized(data.clone()),
        }
    }
}

/// Wait for the ready sentinel on `channel`
pub async fn wait_for_command_request(channel: &mut DataChannel, stop: &StopSignal) -> Result<()> {
    let data = tokio::select! {
        data = channel.recv() => data,
        code = stop.stopped() => return Err(Error::Stopped(code)),
    };
    let Some(data) = data else {
        return Err(Error::ChannelClosed(format!(
            "{} closed while waiting for the node",
            channel.label()
        )));
    };

    match ControlFrame::parse(&data) {
        ControlFrame::Ready => {
            debug!("Command request received");
            Ok(())
        }
        ControlFrame::Status(text) | ControlFrame::Chat(text) => Err(Error::RemoteStatus(text)),
        ControlFrame::Exit(code) => Err(Error::RemoteStatus(format!(
            "node exited with code {code}"
        ))),
        ControlFrame::Unrecognized(raw) => Err(Error::unexpected(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frames() {
        assert_eq!(ControlFrame::parse(&Bytes::from_static(&[42])), ControlFrame::Ready);
        assert_eq!(
            ControlFrame::parse(&Bytes::from_static(br#"{"type":"status","str":"Updating"}"#)),
            ControlFrame::Status("Updating".into())
        );
        assert_eq!(
            ControlFrame::parse(&Bytes::from_static(br#"{"type":"chat","str":"hi"}"#)),
            ControlFrame::Chat("hi".into())
        );
        assert_eq!(
            ControlFrame::parse(&Bytes::from_static(br#"{"type":"exit","code":3}"#)),
            ControlFrame::Exit(3)
        );
        assert!(matches!(
            ControlFrame::parse(&Bytes::from_static(&[43])),
            ControlFrame::Unrecognized(_)
        ));
        assert!(matches!(
            ControlFrame::parse(&Bytes::from_static(br#"{"type":"other"}"#)),
            ControlFrame::Unrecognized(_)
        ));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_sentinel() {
        let (mut ours, theirs) = DataChannel::pair("control");
        theirs.send(Bytes::from_static(&[SENTINEL])).await.unwrap();
        wait_for_command_request(&mut ours, &StopSignal::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_rejects_status_and_garbage() {
        let (mut ours, theirs) = DataChannel::pair("control");
        theirs
            .send_text(r#"{"type":"status","str":"Game is updating"}"#)
            .await
            .unwrap();
        theirs.send_text("hello").await.unwrap();

        let stop = StopSignal::new();
        match wait_for_command_request(&mut ours, &stop).await {
            Err(Error::RemoteStatus(text)) => assert_eq!(text, "Game is updating"),
            other => panic!("unexpected {other:?}"),
        }
        match wait_for_command_request(&mut ours, &stop).await {
            Err(Error::ProtocolViolation { raw }) => assert_eq!(&raw[..], b"hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_reports_close_and_stop() {
        let (mut ours, theirs) = DataChannel::pair("control");
        drop(theirs);
        assert!(matches!(
            wait_for_command_request(&mut ours, &StopSignal::new()).await,
            Err(Error::ChannelClosed(_))
        ));

        let (mut ours, _theirs) = DataChannel::pair("control");
        let stop = StopSignal::new();
        stop.stop(1001);
        assert!(matches!(
            wait_for_command_request(&mut ours, &stop).await,
            Err(Error::Stopped(1001))
        ));
    }
}
