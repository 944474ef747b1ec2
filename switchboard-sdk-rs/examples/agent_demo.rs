use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use switchboard_sdk_rs::{
    agent::{AcceptRule, Agent, CompositeAgent, DelegationPolicy, LeafAgent},
    config::OrchestratorConfig,
    error::ToolError,
    events::EventPayload,
    llm::{GenaiConfig, GenaiGenerator, Generator},
    router::{RouteDelegator, Router},
    runner::Runner,
    scenario::{SCENARIO_STATE_KEY, Scenario, ScenarioComponent},
    session::StateMap,
    tools::{FunctionTool, str_arg},
};
use tokio::io::{AsyncBufReadExt, BufReader};

const DOCS: [&str; 2] = [
    "Switchboard routes each request to the agent best suited to answer it.",
    "Composite agents run their sub-agents in sequence, in parallel or by custom rules.",
];

fn weather_tool() -> FunctionTool {
    FunctionTool::new(
        "get_weather",
        "Return the current weather for a city",
        json!({
            "type": "object",
            "properties": {"location": {"type": "string"}},
            "required": ["location"]
        }),
        |args| async move {
            let location = str_arg(&args, "location")?;
            let report = match location.to_lowercase().as_str() {
                "seoul" => "sunny, 25 °C",
                "busan" => "partly cloudy, 23 °C",
                "tokyo" => "rain, 21 °C",
                _ => "a few clouds, 24 °C",
            };
            Ok(json!({"status": "success", "report": report}).to_string())
        },
    )
}

fn retrieve_tool() -> FunctionTool {
    FunctionTool::new(
        "retrieve_doc",
        "Return the stored snippet that best matches the query",
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }),
        |args| async move {
            let query = str_arg(&args, "query")?.to_lowercase();
            let best = DOCS
                .iter()
                .max_by_key(|doc| {
                    let doc = doc.to_lowercase();
                    query.split_whitespace().filter(|w| doc.contains(w)).count()
                })
                .copied()
                .unwrap_or_default();
            Ok(json!({"status": "success", "snippet": best}).to_string())
        },
    )
}

#[derive(Debug, Clone, Serialize)]
struct Order {
    id: String,
    item: String,
    status: String,
    price: String,
}

type Orders = Arc<Mutex<Vec<Order>>>;

fn sample_orders() -> Orders {
    let order = |id: &str, item: &str, status: &str, price: &str| Order {
        id: id.to_string(),
        item: item.to_string(),
        status: status.to_string(),
        price: price.to_string(),
    };
    Arc::new(Mutex::new(vec![
        order("ORD001", "smartphone", "processing", "800,000 KRW"),
        order("ORD002", "laptop", "shipped", "1,200,000 KRW"),
        order("ORD003", "tablet", "processing", "600,000 KRW"),
    ]))
}

fn get_orders_tool(orders: Orders) -> FunctionTool {
    FunctionTool::new(
        "get_orders",
        "List orders, optionally only those with the given status",
        json!({"type": "object", "properties": {"status": {"type": "string"}}}),
        move |args| {
            let orders = orders.clone();
            async move {
                let status = args.get("status").and_then(|v| v.as_str());
                let found: Vec<Order> = orders
                    .lock()
                    .iter()
                    .filter(|o| status.is_none_or(|s| o.status == s))
                    .cloned()
                    .collect();
                Ok(json!({"status": "success", "count": found.len(), "orders": found}).to_string())
            }
        },
    )
}

fn get_order_tool(orders: Orders) -> FunctionTool {
    FunctionTool::new(
        "get_order_by_id",
        "Look up one order",
        json!({
            "type": "object",
            "properties": {"order_id": {"type": "string"}},
            "required": ["order_id"]
        }),
        move |args| {
            let orders = orders.clone();
            async move {
                let id = str_arg(&args, "order_id")?;
                let order = orders.lock().iter().find(|o| o.id == id).cloned();
                order
                    .map(|o| json!({"status": "success", "order": o}).to_string())
                    .ok_or_else(|| ToolError::Execution(format!("order {} not found", id)))
            }
        },
    )
}

fn create_order_tool(orders: Orders) -> FunctionTool {
    FunctionTool::new(
        "create_order",
        "Place a new order",
        json!({
            "type": "object",
            "properties": {"item": {"type": "string"}, "price": {"type": "string"}},
            "required": ["item", "price"]
        }),
        move |args| {
            let orders = orders.clone();
            async move {
                let mut orders = orders.lock();
                let order = Order {
                    id: format!("ORD{:03}", orders.len() + 1),
                    item: str_arg(&args, "item")?.to_string(),
                    status: "processing".to_string(),
                    price: str_arg(&args, "price")?.to_string(),
                };
                orders.push(order.clone());
                Ok(json!({"status": "success", "order": order}).to_string())
            }
        },
    )
}

fn cancel_order_tool(orders: Orders) -> FunctionTool {
    FunctionTool::new(
        "cancel_order",
        "Cancel an order that is still processing",
        json!({
            "type": "object",
            "properties": {"order_id": {"type": "string"}},
            "required": ["order_id"]
        }),
        move |args| {
            let orders = orders.clone();
            async move {
                let id = str_arg(&args, "order_id")?;
                let mut orders = orders.lock();
                let order = orders
                    .iter_mut()
                    .find(|o| o.id == id)
                    .ok_or_else(|| ToolError::Execution(format!("order {} not found", id)))?;
                if order.status != "processing" {
                    return Ok(json!({
                        "status": "error",
                        "message": format!("order {} is {} and can no longer be cancelled", id, order.status)
                    })
                    .to_string());
                }
                order.status = "cancelled".to_string();
                Ok(json!({"status": "success", "message": format!("order {} cancelled", id)}).to_string())
            }
        },
    )
}

/// Order desk: a router picks inquiry, creation or cancellation per request.
fn order_agent(generator: Arc<dyn Generator>) -> Agent {
    let orders = sample_orders();
    let inquiry = LeafAgent::builder("order_inquiry_agent", generator.clone())
        .description("Looks up orders and their status.")
        .instruction("Answer questions about orders with `get_orders` and `get_order_by_id`.")
        .tool(get_orders_tool(orders.clone()))
        .tool(get_order_tool(orders.clone()))
        .build();
    let creation = LeafAgent::builder("order_creation_agent", generator.clone())
        .description("Places new orders.")
        .instruction(
            "Confirm the item and price, then call `create_order(item, price)` \
             and report the new order id.",
        )
        .tool(create_order_tool(orders.clone()))
        .build();
    let cancel = LeafAgent::builder("cancel_order_agent", generator.clone())
        .description("Cancels orders that have not shipped yet.")
        .instruction(
            "List cancellable orders with `get_orders(status=\"processing\")`, \
             ask which one if it is unclear, then call `cancel_order(order_id)`.",
        )
        .tool(get_orders_tool(orders.clone()))
        .tool(cancel_order_tool(orders))
        .output_key("cancel_result")
        .build();

    let desk = RouteDelegator::new(Arc::new(Router::classifying(generator)));
    CompositeAgent::builder("order_agent", DelegationPolicy::Conditional(Arc::new(desk)))
        .description("Handles order inquiries, new orders and cancellations.")
        .accepts(AcceptRule::keywords(["order", "주문"]))
        .sub_agent(Arc::new(inquiry))
        .sub_agent(Arc::new(creation))
        .sub_agent(Arc::new(cancel))
        .build()
}

fn travel_scenario(generator: Arc<dyn Generator>, accept: AcceptRule) -> anyhow::Result<Agent> {
    let city_input = LeafAgent::builder("city_input_agent", generator.clone())
        .instruction(
            "Ask the user which city they want to visit. Reply with JSON only:\n\
             ```json\n{\"decision\": \"complete\" | \"continue\", \"city_name\": \"...\", \"user_message\": \"...\"}\n```\n\
             Use \"continue\" while the city is still unknown.",
        )
        .structured_output()
        .build();
    let city_info = LeafAgent::builder("city_info_agent", generator)
        .instruction("Introduce {city_name} in a few sentences: sights, food and the best season.")
        .build();

    Ok(Scenario::new("travel_planner", "city_input")
        .description("Plans a trip: asks for a destination, then introduces it.")
        .accepts(accept)
        .component(ScenarioComponent::new("city_input", Arc::new(city_input)).then("city_info"))
        .component(ScenarioComponent::new("city_info", Arc::new(city_info)))
        .build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    switchboard_sdk_rs::logger::init_logging();

    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if api_key.is_none() {
        println!("OPENAI_API_KEY not set. Please set it to run this example.");
        return Ok(());
    }

    let generator: Arc<dyn Generator> = Arc::new(GenaiGenerator::new(GenaiConfig {
        model: "gpt-5-nano".to_string(),
        api_key,
    }));

    let weather = LeafAgent::builder("weather_agent", generator.clone())
        .description("Provides quick weather summaries.")
        .accepts(AcceptRule::keywords(["weather", "날씨"]))
        .instruction(
            "Call `get_weather(location)` and present the report politely. \
             If the user names no city, use Seoul.",
        )
        .tool(weather_tool())
        .build();
    let rag = LeafAgent::builder("rag_agent", generator.clone())
        .description("General Q&A backed by a tiny document store.")
        .instruction("Use `retrieve_doc(query)` whenever you need facts and cite the snippet.")
        .tool(retrieve_tool())
        .build();

    let roster = vec![
        Arc::new(weather),
        Arc::new(order_agent(generator.clone())),
        Arc::new(travel_scenario(
            generator.clone(),
            AcceptRule::keywords(["travel", "trip", "여행"]),
        )?),
        Arc::new(rag),
    ];
    let config = OrchestratorConfig::from_env()?;
    // a scenario waiting for an answer gets the next message whatever it says
    let resume_runner = Runner::new(
        vec![Arc::new(travel_scenario(generator.clone(), AcceptRule::Any)?)],
        Router::first_accepting(),
    )
    .with_config(config.clone());
    let runner = Runner::new(roster, Router::classifying(generator)).with_config(config);

    println!("Switchboard demo. Type 'exit' to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut carried = StateMap::new();

    loop {
        println!("\n> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        if matches!(request, "exit" | "quit" | "bye") {
            break;
        }

        let active = if carried.contains_key(SCENARIO_STATE_KEY) {
            &resume_runner
        } else {
            &runner
        };
        let mut stream = active.start(request, std::mem::take(&mut carried));
        while let Some(event) = stream.next().await {
            match &event.payload {
                EventPayload::ToolCall { tool_name, arguments } => {
                    println!("  [{}] calling {} {}", event.agent_id, tool_name, arguments)
                }
                EventPayload::Delegation { delegated_to } => {
                    println!("  [{}] -> {}", event.agent_id, delegated_to)
                }
                EventPayload::FinalResult { result } if event.depth == 0 => {
                    println!("{}", result)
                }
                EventPayload::Error { message, origin, .. } if event.depth == 0 => {
                    println!("error from {}: {}", origin, message)
                }
                EventPayload::Cancelled { reason } => println!("cancelled: {}", reason),
                _ => {}
            }
        }

        if let Some(progress) = stream.state().get(SCENARIO_STATE_KEY) {
            carried.insert(SCENARIO_STATE_KEY.to_string(), progress);
        }
    }

    Ok(())
}
