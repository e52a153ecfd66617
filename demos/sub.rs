// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Subscribes to the demo topic and prints every message until the client
//! terminates:
//!
//! ```bash
//! cargo run --bin turbomqtt-sub -- 127.0.0.1:1883
//! ```

use std::env;

use turbomqtt::{Client, ConnectOptions, Error, QoS};

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let address = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1883".to_string());
    let options = ConnectOptions::new(&address);

    let (client, mut messages) = Client::connect(options).await?;
    client.subscribe("turbomqtt/demo", QoS::AtLeastOnce).await?;
    log::info!("subscribed, waiting for messages");

    while let Some(message) = messages.next().await {
        println!(
            "{}: {}",
            message.topic(),
            String::from_utf8_lossy(message.payload())
        );
    }

    client.disconnect().await
}
