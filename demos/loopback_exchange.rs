//! Loopback exchange between two stacks
//!
//! Two stacks share an in-memory network. The server answers ReadProperty
//! with a ComplexACK large enough to need segmentation and rejects
//! everything else; the client discovers it with Who-Is/I-Am, then sends a
//! few confirmed requests and prints their outcomes.
//!
//! Run with `RUST_LOG=debug` to follow the transactions.

use std::time::Duration;

use tokio::sync::mpsc;

use bacnet_tsm::config::StackConfig;
use bacnet_tsm::datalink::{DataLinkAddress, MemoryDataLink, MemoryNetwork};
use bacnet_tsm::driver::{DriverConfig, StackHandle};
use bacnet_tsm::network::Route;
use bacnet_tsm::service::{
    ConfirmedServiceChoice, IAmRequest, RequestContext, Segmentation, ServiceResponse,
    UnconfirmedServiceChoice, WhoIsRequest,
};
use bacnet_tsm::stack::{Stack, StackError};
use bacnet_tsm::Outcome;

const SERVER_DEVICE: u32 = 2000;
const CLIENT_ADDRESS: DataLinkAddress = DataLinkAddress::MsTP(1);
const SERVER_ADDRESS: DataLinkAddress = DataLinkAddress::MsTP(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("=== BACnet Loopback Exchange ===\n");

    let network = MemoryNetwork::new();
    let server = build_server(&network)?;

    let mut config = StackConfig::default();
    config.max_apdu_length = 480;
    let client = StackHandle::spawn(
        Stack::new(config, network.attach(CLIENT_ADDRESS))?,
        DriverConfig::default(),
    );

    // 1. Address resolution
    println!("1. Resolving device {}", SERVER_DEVICE);
    let read_property = ConfirmedServiceChoice::ReadProperty as u8;
    let request = vec![0x0C, 0x02, 0x00, 0x07, 0xD0, 0x19, 0x4D];
    match client.request(SERVER_DEVICE, read_property, request.clone()).await {
        Err(StackError::Unresolved(device)) => {
            println!("  Device {} unknown, Who-Is broadcast", device)
        }
        other => println!("  Unexpected: {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!(
        "  Bindings after I-Am: {}",
        client.stack().lock().await.bindings().len()
    );

    // 2. Segmented ComplexACK
    println!("\n2. ReadProperty (segmented response)");
    let outcome = client.request(SERVER_DEVICE, read_property, request).await?;
    println!("  Outcome: {}", describe(&outcome));

    // 3. Service the server does not implement
    println!("\n3. WriteProperty (not implemented by the server)");
    let outcome = client
        .request(
            SERVER_DEVICE,
            ConfirmedServiceChoice::WriteProperty as u8,
            vec![0x0C, 0x00, 0x00, 0x00, 0x01],
        )
        .await?;
    println!("  Outcome: {}", describe(&outcome));

    // 4. Statistics
    {
        let client = client.stack();
        let client = client.lock().await;
        let stats = client.tsm_statistics();
        println!("\n4. Client statistics");
        println!("  Acked: {}", stats.completed_ack);
        println!("  Rejected: {}", stats.completed_reject);
        println!("  Segments received: {}", stats.segments_received);
        println!("  Frames sent: {}", client.statistics().frames_sent);
    }

    client.shutdown().await;
    server.shutdown().await;

    println!("\n=== Loopback Exchange Complete ===");
    Ok(())
}

fn build_server(network: &MemoryNetwork) -> Result<StackHandle<MemoryDataLink>, StackError> {
    let mut server = Stack::new(StackConfig::default(), network.attach(SERVER_ADDRESS))?;

    let object_list: Vec<u8> = (0..600u16).map(|i| (i % 250) as u8).collect();
    server.register_confirmed_handler(
        ConfirmedServiceChoice::ReadProperty as u8,
        move |_: u8, payload: &[u8], context: &RequestContext| {
            log::info!(
                "ReadProperty from {} (invoke id {}, {} bytes)",
                context.source,
                context.invoke_id(),
                payload.len()
            );
            ServiceResponse::ComplexAck(object_list.clone())
        },
    );

    // Handlers cannot send; matching Who-Is requests are answered from a task
    let (tx, mut rx) = mpsc::unbounded_channel::<Route>();
    server.register_unconfirmed_handler(
        UnconfirmedServiceChoice::WhoIs as u8,
        move |_: u8, payload: &[u8], source: &Route| {
            if WhoIsRequest::decode(payload).is_ok_and(|who_is| who_is.matches(SERVER_DEVICE)) {
                let _ = tx.send(*source);
            }
        },
    );

    let handle = StackHandle::spawn(server, DriverConfig::default());
    let stack = handle.stack();
    tokio::spawn(async move {
        let i_am = IAmRequest::new(SERVER_DEVICE, 1476, Segmentation::Both, 260);
        while let Some(requester) = rx.recv().await {
            log::debug!("answering Who-Is from {}", requester);
            if let Err(err) = stack.lock().await.send_i_am(Route::local_broadcast(), &i_am) {
                log::warn!("I-Am failed: {}", err);
            }
        }
    });

    Ok(handle)
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Ack(data) => format!("ACK with {} bytes", data.len()),
        Outcome::Error { class, code } => format!("Error class {} code {}", class, code),
        Outcome::Reject(reason) => format!("Reject: {}", reason),
        Outcome::Abort(reason) => format!("Abort: {}", reason),
        other => format!("{:?}", other),
    }
}
