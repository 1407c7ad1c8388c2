use lapin::{BasicProperties, Connection, ConnectionProperties, options::*};
use request_consumer::config::Config;
use request_consumer::contracts::Request;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let url = config.connection.amqp_url()?;

    println!("Connecting to RabbitMQ...");
    let connection = Connection::connect(&url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    println!("Publishing requests to {}...", config.consumer.queue_name);

    let commands = [
        (Some("say"), "Success"),
        (None, "Success without command"),
        (Some("discard"), "Discarded (nack without requeue)"),
        (Some("retry"), "Acked and republished"),
        (Some("say"), "Success"),
    ];

    for (command, description) in commands {
        let mut request = Request::with_id(uuid::Uuid::new_v4().to_string());
        request.command = command.map(str::to_string);
        request
            .parameters
            .insert("message".to_string(), serde_json::json!(description));

        channel
            .basic_publish(
                "",
                &config.consumer.queue_name,
                BasicPublishOptions::default(),
                request.to_body()?.as_bytes(),
                BasicProperties::default().with_content_type("text/plain".into()),
            )
            .await?;

        println!("Published {}: {}", request.id, description);
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    }

    println!("\nAll requests published!");
    println!("- a \"crash\" command would requeue and raise the panic flag, so none is sent");

    connection.close(200, "Normal shutdown").await?;
    Ok(())
}
