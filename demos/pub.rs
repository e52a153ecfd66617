// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Publishes ten messages to a local broker, e.g. EMQX or NanoMQ on the
//! default port:
//!
//! ```bash
//! cargo run --bin turbomqtt-pub -- 127.0.0.1:1883
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

    let (client, _messages) = Client::connect(options).await?;
    log::info!("connected to {address}");

    for n in 0..10 {
        let payload = format!("hello from turbomqtt #{n}");
        client
            .publish("turbomqtt/demo", QoS::AtLeastOnce, payload.as_bytes())?
            .wait()
            .await?;
        println!("published: {payload}");
    }

    client.disconnect().await
}
