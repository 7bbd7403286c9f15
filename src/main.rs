use rustie_mqtt_client::{Client, ConnectionOptions, InboundEvent, MqttError, QoS, Will};
use std::env;
use tokio::time::{timeout, Duration};

#[tokio::main]
async fn main() -> Result<(), MqttError> {
    tracing_subscriber::fmt().init();
    let uri = env::args()
        .nth(1)
        .or_else(|| env::var("MQTT_URI").ok())
        .unwrap_or_else(|| "tcp://127.0.0.1:1883".to_string());

    let client = Client::new();
    let mut events = client.events().await;
    let options = ConnectionOptions::new()
        .with_keep_alive(30)
        .with_will(Will::new("rustie/status", "offline").with_retain(true));

    let connection = client.connect(&uri, Some(options)).await?;
    println!("Connected to {}", connection.peer());

    client.subscribe(&connection, "rustie/demo", QoS::AtLeastOnce).await?;
    for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
        let message = format!("hello at {:?}", qos);
        client
            .publish(&connection, "rustie/demo", message, qos, false, false)
            .await?;
    }

    while let Ok(Some(event)) = timeout(Duration::from_secs(2), events.recv()).await {
        match event {
            InboundEvent::Publish(publish) => println!(
                "Message on {}: {}",
                publish.topic,
                String::from_utf8_lossy(&publish.payload)
            ),
            other => println!("{:?}", other),
        }
    }

    client.unsubscribe(&connection, "rustie/demo").await?;
    client.disconnect(&connection).await;
    Ok(())
}
