mod interruption_test;
mod transfer_test;
