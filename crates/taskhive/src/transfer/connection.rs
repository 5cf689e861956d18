use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use orion::aead::SecretKey;
use orion::aead::streaming::{StreamOpener, StreamSealer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use hive::comm::{
    CLIENT_ROLE, SERVER_ROLE, do_authentication, make_framed, open_message, seal_message,
};

use crate::common::error::TaskhiveError;
use crate::transfer::messages::{FromClientMessage, ToClientMessage};

type Frames = Framed<TcpStream, LengthDelimitedCodec>;

/// Version of the client protocol, checked during the handshake
const CLIENT_PROTOCOL: u32 = 1;

/// Which end of a client connection this process is.
#[derive(Copy, Clone, Debug)]
enum Side {
    Server,
    Client,
}

impl Side {
    fn roles(self) -> (&'static str, &'static str) {
        match self {
            Side::Server => (SERVER_ROLE, CLIENT_ROLE),
            Side::Client => (CLIENT_ROLE, SERVER_ROLE),
        }
    }
}

fn encode<T: Serialize>(item: &T, sealer: &mut Option<StreamSealer>) -> crate::Result<Bytes> {
    let data = hive::comm::serialize(item)?;
    Ok(seal_message(sealer, data.into())?)
}

fn decode<T: DeserializeOwned>(
    frame: std::io::Result<BytesMut>,
    opener: &mut Option<StreamOpener>,
) -> crate::Result<T> {
    Ok(open_message(opener, &frame?)?)
}

/// Authenticated connection that receives `R` and sends `S`.
pub struct Connection<R, S> {
    writer: SplitSink<Frames, Bytes>,
    reader: SplitStream<Frames>,
    sealer: Option<StreamSealer>,
    opener: Option<StreamOpener>,
    messages: PhantomData<fn(S) -> R>,
}

pub type ClientConnection = Connection<ToClientMessage, FromClientMessage>;
pub type ServerConnection = Connection<FromClientMessage, ToClientMessage>;

impl<R: DeserializeOwned, S: Serialize> Connection<R, S> {
    async fn handshake(
        socket: TcpStream,
        side: Side,
        key: Option<Arc<SecretKey>>,
    ) -> crate::Result<Self> {
        socket.set_nodelay(true)?;
        let (mut writer, mut reader) = make_framed(socket).split();
        let (role, peer_role) = side.roles();
        let (sealer, opener) = do_authentication(
            CLIENT_PROTOCOL,
            role,
            peer_role,
            key,
            &mut writer,
            &mut reader,
        )
        .await?;
        Ok(Connection {
            writer,
            reader,
            sealer,
            opener,
            messages: PhantomData,
        })
    }

    pub async fn send(&mut self, item: S) -> crate::Result<()> {
        let frame = encode(&item, &mut self.sealer)?;
        self.writer.send(frame).await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Option<crate::Result<R>> {
        let frame = self.reader.next().await?;
        Some(decode(frame, &mut self.opener))
    }

    pub async fn send_and_receive(&mut self, item: S) -> crate::Result<R> {
        self.send(item).await?;
        self.receive().await.unwrap_or_else(|| {
            Err(TaskhiveError::Generic(
                "Connection closed before the response arrived".to_string(),
            ))
        })
    }

    /// Separates the connection into a message sink and a message stream.
    pub fn split(
        self,
    ) -> (
        impl Sink<S, Error = crate::Error>,
        impl Stream<Item = crate::Result<R>>,
    ) {
        let Connection {
            writer,
            reader,
            mut sealer,
            mut opener,
            ..
        } = self;
        let sink = writer
            .sink_map_err(crate::Error::from)
            .with(move |item: S| futures::future::ready(encode(&item, &mut sealer)));
        let stream = reader.map(move |frame| decode(frame, &mut opener));
        (sink, stream)
    }
}

impl ServerConnection {
    pub async fn accept_client(
        socket: TcpStream,
        key: Option<Arc<SecretKey>>,
    ) -> crate::Result<ServerConnection> {
        Connection::handshake(socket, Side::Server, key).await
    }
}

/// Connection of a client to a running server.
pub struct ClientSession {
    connection: ClientConnection,
}

impl ClientSession {
    pub async fn connect_to_server(
        address: &str,
        key: Option<Arc<SecretKey>>,
    ) -> crate::Result<ClientSession> {
        let socket = TcpStream::connect(address).await?;
        let connection = Connection::handshake(socket, Side::Client, key).await?;
        Ok(ClientSession { connection })
    }

    pub fn connection(&mut self) -> &mut ClientConnection {
        &mut self.connection
    }
}
