use std::env;

use emrtd_bac::{bytes2hex, BacProtocol, EmrtdComms, EmrtdError, ErrorKind};
use tracing::{error, info};

fn main() -> Result<(), EmrtdError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    // Document number, date of birth and date of expiry, each with its check digit.
    let Some(mrz) = env::args().nth(1).or_else(|| env::var("MRZ").ok()) else {
        error!("Pass the MRZ information as an argument or in the MRZ environment variable");
        std::process::exit(2);
    };

    // Establish a PC/SC context.
    let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("Failed to establish context: {err}");
            std::process::exit(1);
        }
    };

    // List available readers.
    let mut readers_buf = [0; 2048];
    let mut readers = match ctx.list_readers(&mut readers_buf) {
        Ok(readers) => readers,
        Err(err) => {
            error!("Failed to list readers: {err}");
            std::process::exit(1);
        }
    };

    // Use the first reader.
    let Some(reader) = readers.next() else {
        error!("No readers are connected.");
        std::process::exit(1);
    };
    info!("Using reader: {reader:?}");

    // Connect to the card.
    let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(pcsc::Error::NoSmartcard) => {
            error!("A smartcard is not present in the reader.");
            std::process::exit(1);
        }
        Err(err) => {
            error!("Failed to connect to card: {err}");
            std::process::exit(1);
        }
    };

    let mut comms = EmrtdComms::new(card);

    // Get the card's ATR.
    info!("ATR from attribute: {}", bytes2hex(&comms.get_atr()?));

    // Select eMRTD application
    comms.select_emrtd_application()?;

    let mut bac = BacProtocol::<&mut EmrtdComms<pcsc::Card>>::new(&mut comms);
    match bac.perform_handshake(&mrz) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AuthenticationRejected => {
            error!("The chip rejected the MRZ information: {err}");
            std::process::exit(1);
        }
        Err(err) if err.kind() == ErrorKind::Cancelled => {
            error!("Card communication was interrupted: {err}");
            std::process::exit(1);
        }
        Err(err) => return Err(err),
    }

    if let Some(channel) = comms.secure_channel() {
        info!("Secure channel ready, SSC: {}", bytes2hex(channel.ssc()));
    }

    Ok(())
}
